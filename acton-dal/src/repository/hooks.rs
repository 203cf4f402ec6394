//! Write hooks run on every record just before it reaches the store
//!
//! Hooks see the serialized record (for inserts) or the change set (for
//! updates) and may rewrite it in place. They run on `create`, `create_many`
//! and `update`; soft-delete and restore writes are policy-owned and skip them.

use std::collections::HashSet;

use serde_json::Value;

use crate::store::Record;

/// Record transformation applied before insert and update
pub trait WriteHook: Send + Sync {
    /// Called once per row before it is inserted
    fn before_insert(&self, _table: &str, _record: &mut Record) {}

    /// Called with the change set before an update
    fn before_update(&self, _table: &str, _changes: &mut Record) {}
}

/// Lowercases every top-level string field except the exempt ones
///
/// # Example
///
/// ```rust
/// use acton_dal::repository::{LowercaseStrings, WriteHook};
/// use serde_json::json;
///
/// let hook = LowercaseStrings::new().exempt("password_hash");
/// let mut record = json!({ "email": "Ada@Example.COM", "password_hash": "AbC" })
///     .as_object()
///     .cloned()
///     .unwrap();
/// hook.before_insert("users", &mut record);
/// assert_eq!(record["email"], json!("ada@example.com"));
/// assert_eq!(record["password_hash"], json!("AbC"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct LowercaseStrings {
    exempt: HashSet<String>,
}

impl LowercaseStrings {
    /// Lowercase every string field
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave `field` as written
    #[must_use]
    pub fn exempt(mut self, field: impl Into<String>) -> Self {
        self.exempt.insert(field.into());
        self
    }

    fn lowercase(&self, record: &mut Record) {
        for (key, value) in record.iter_mut() {
            if self.exempt.contains(key) {
                continue;
            }
            if let Value::String(s) = value {
                *s = s.to_lowercase();
            }
        }
    }
}

impl WriteHook for LowercaseStrings {
    fn before_insert(&self, _table: &str, record: &mut Record) {
        self.lowercase(record);
    }

    fn before_update(&self, _table: &str, changes: &mut Record) {
        self.lowercase(changes);
    }
}
