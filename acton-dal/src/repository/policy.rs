//! Soft-delete policy
//!
//! The policy names the column that marks a row as deleted and decides what
//! the default read filter, the soft-delete write and the restore write look
//! like. It is fixed when the repository is built.
//!
//! # Example
//!
//! ```rust
//! use acton_dal::repository::{FilterCondition, FindOptions, SoftDeletePolicy};
//!
//! let policy = SoftDeletePolicy::default();
//! let merged = policy.apply_default(&FindOptions::new());
//! assert_eq!(merged.filters, vec![FilterCondition::eq("is_deleted", false)]);
//!
//! // caller targets the marker column explicitly: caller wins
//! let trash = FindOptions::new().filter(FilterCondition::eq("is_deleted", true));
//! assert_eq!(policy.apply_default(&trash), trash);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::pagination::{FilterCondition, FindOptions};
use crate::store::Record;

/// How rows are marked deleted without being removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SoftDeletePolicy {
    /// Boolean marker column (`is_deleted`), with audit columns stamped on delete
    Flag {
        /// Boolean marker column
        #[serde(default = "default_flag_field")]
        field: String,
        /// Column receiving the deletion timestamp
        #[serde(default = "default_deleted_at_field")]
        deleted_at_field: Option<String>,
        /// Column receiving the deleting actor
        #[serde(default = "default_deleted_by_field")]
        deleted_by_field: Option<String>,
        /// Null the audit columns when restoring
        #[serde(default)]
        clear_audit_on_restore: bool,
    },
    /// Nullable timestamp column (`deleted_at`); a non-null value means deleted
    Timestamp {
        /// Timestamp marker column
        #[serde(default = "default_deleted_at")]
        field: String,
        /// Column receiving the deleting actor
        #[serde(default = "default_deleted_by_field")]
        deleted_by_field: Option<String>,
    },
    /// No soft-delete support: no default filter, soft_delete/restore are rejected
    Disabled,
}

fn default_flag_field() -> String {
    "is_deleted".to_string()
}

fn default_deleted_at() -> String {
    "deleted_at".to_string()
}

fn default_deleted_at_field() -> Option<String> {
    Some(default_deleted_at())
}

fn default_deleted_by_field() -> Option<String> {
    Some("deleted_by".to_string())
}

impl Default for SoftDeletePolicy {
    fn default() -> Self {
        Self::flag()
    }
}

impl SoftDeletePolicy {
    /// `is_deleted` flag with `deleted_at`/`deleted_by` audit columns
    #[must_use]
    pub fn flag() -> Self {
        Self::Flag {
            field: default_flag_field(),
            deleted_at_field: default_deleted_at_field(),
            deleted_by_field: default_deleted_by_field(),
            clear_audit_on_restore: false,
        }
    }

    /// Flag policy on a custom marker column
    #[must_use]
    pub fn flag_field(field: impl Into<String>) -> Self {
        match Self::flag() {
            Self::Flag {
                deleted_at_field,
                deleted_by_field,
                clear_audit_on_restore,
                ..
            } => Self::Flag {
                field: field.into(),
                deleted_at_field,
                deleted_by_field,
                clear_audit_on_restore,
            },
            other => other,
        }
    }

    /// `deleted_at IS NULL` visibility with a `deleted_by` audit column
    #[must_use]
    pub fn timestamp() -> Self {
        Self::Timestamp {
            field: default_deleted_at(),
            deleted_by_field: default_deleted_by_field(),
        }
    }

    /// Whether this is the `flag()` policy every repository starts with
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// The column that marks a row deleted, if any
    pub fn marker_field(&self) -> Option<&str> {
        match self {
            Self::Flag { field, .. } | Self::Timestamp { field, .. } => Some(field),
            Self::Disabled => None,
        }
    }

    /// Whether soft delete is active at all
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// Predicate selecting rows that are not soft-deleted
    pub fn visible_filter(&self) -> Option<FilterCondition> {
        match self {
            Self::Flag { field, .. } => Some(FilterCondition::eq(field.as_str(), false)),
            Self::Timestamp { field, .. } => Some(FilterCondition::is_null(field.as_str())),
            Self::Disabled => None,
        }
    }

    /// Predicate selecting rows that are soft-deleted
    pub fn deleted_filter(&self) -> Option<FilterCondition> {
        match self {
            Self::Flag { field, .. } => Some(FilterCondition::eq(field.as_str(), true)),
            Self::Timestamp { field, .. } => Some(FilterCondition::is_not_null(field.as_str())),
            Self::Disabled => None,
        }
    }

    /// Merge the default visibility predicate into a copy of `options`
    ///
    /// The default is skipped when the caller already filters on the marker
    /// column, so an explicit condition on that column wins.
    pub fn apply_default(&self, options: &FindOptions) -> FindOptions {
        let mut merged = options.clone();
        if let Some(default) = self.visible_filter() {
            if !options.targets(&default.field) {
                merged.filters.push(default);
            }
        }
        merged
    }

    /// Like [`apply_default`](Self::apply_default) but selecting deleted rows
    pub fn apply_deleted(&self, options: &FindOptions) -> FindOptions {
        let mut merged = options.clone();
        if let Some(deleted) = self.deleted_filter() {
            if !options.targets(&deleted.field) {
                merged.filters.push(deleted);
            }
        }
        merged
    }

    /// Fill in the marker for a new row when the caller left it out
    pub fn stamp_insert(&self, record: &mut Record) {
        if let Self::Flag { field, .. } = self {
            record
                .entry(field.clone())
                .or_insert(Value::Bool(false));
        }
    }

    /// Changes written by a soft delete
    pub fn deleted_changes(&self, deleted_by: Option<&str>, now: DateTime<Utc>) -> Option<Record> {
        let mut changes = Record::new();
        let (by_field, at_field) = match self {
            Self::Flag {
                field,
                deleted_at_field,
                deleted_by_field,
                ..
            } => {
                changes.insert(field.clone(), Value::Bool(true));
                (deleted_by_field, deleted_at_field.as_ref())
            }
            Self::Timestamp {
                field,
                deleted_by_field,
            } => (deleted_by_field, Some(field)),
            Self::Disabled => return None,
        };

        if let Some(at_field) = at_field {
            changes.insert(at_field.clone(), Value::String(now.to_rfc3339()));
        }
        if let (Some(by_field), Some(actor)) = (by_field, deleted_by) {
            changes.insert(by_field.clone(), Value::String(actor.to_string()));
        }
        Some(changes)
    }

    /// Changes written by a restore
    pub fn restored_changes(&self) -> Option<Record> {
        let mut changes = Record::new();
        match self {
            Self::Flag {
                field,
                deleted_at_field,
                deleted_by_field,
                clear_audit_on_restore,
            } => {
                changes.insert(field.clone(), Value::Bool(false));
                if *clear_audit_on_restore {
                    for audit in [deleted_at_field, deleted_by_field].into_iter().flatten() {
                        changes.insert(audit.clone(), Value::Null);
                    }
                }
            }
            Self::Timestamp { field, .. } => {
                changes.insert(field.clone(), Value::Null);
            }
            Self::Disabled => return None,
        }
        Some(changes)
    }
}
