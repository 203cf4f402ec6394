//! Entity store adapters
//!
//! An [`EntityStore`] is the persistence engine seen from the repository: it
//! inserts, selects, counts, updates and deletes JSON records in a named
//! table, against either the default connection or an open transaction
//! session. The repository never talks to an engine any other way.
//!
//! Two adapters ship with the crate:
//!
//! - [`MemoryStore`]: in-process tables with snapshot transactions, always built
//! - `PgStore`: PostgreSQL through sqlx, behind the `database` feature

use std::future::Future;

use serde_json::Value;

use crate::error::StoreError;
use crate::repository::{FilterCondition, FindOptions, TransactionSession};

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

pub use memory::{IdStrategy, MemorySession, MemoryStore, MemoryStoreBuilder, MemoryTables, TableSchema};
#[cfg(feature = "database")]
pub use postgres::{PgSession, PgStore};

/// A row as exchanged with a store: column name to JSON value
pub type Record = serde_json::Map<String, Value>;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The resolved target an operation executes against
///
/// `Default` persists immediately on the store's own connection; `Session`
/// routes the operation through a caller-owned transaction.
#[derive(Debug)]
pub enum Handle<'a, S> {
    /// The store's default connection
    Default,
    /// An open transaction owned by the caller
    Session(&'a S),
}

impl<S> Clone for Handle<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for Handle<'_, S> {}

impl<'a, S> Handle<'a, S> {
    /// Resolve an optional session into a handle
    pub fn resolve(session: Option<&'a S>) -> Self {
        match session {
            Some(session) => Self::Session(session),
            None => Self::Default,
        }
    }

    /// The session, when bound to one
    pub fn session(&self) -> Option<&'a S> {
        match self {
            Self::Default => None,
            Self::Session(session) => Some(session),
        }
    }

    /// Whether the handle is bound to a transaction session
    pub fn is_session(&self) -> bool {
        matches!(self, Self::Session(_))
    }
}

/// Persistence engine contract consumed by the repository
///
/// Methods return `impl Future + Send` so implementations can be plain
/// `async fn`s without `async_trait`.
pub trait EntityStore: Send + Sync {
    /// Transaction session type handed out by this store
    type Session: TransactionSession;

    /// A fresh, not-yet-started session
    fn session(&self) -> Self::Session;

    /// Insert rows and return them as persisted, in input order
    ///
    /// A batch is all-or-nothing: if any row fails, none are kept.
    fn insert(
        &self,
        handle: Handle<'_, Self::Session>,
        table: &str,
        rows: Vec<Record>,
    ) -> impl Future<Output = StoreResult<Vec<Record>>> + Send;

    /// Select rows matching every filter, ordered and sliced per `options`
    fn find(
        &self,
        handle: Handle<'_, Self::Session>,
        table: &str,
        options: &FindOptions,
    ) -> impl Future<Output = StoreResult<Vec<Record>>> + Send;

    /// Count rows matching every filter
    fn count(
        &self,
        handle: Handle<'_, Self::Session>,
        table: &str,
        filters: &[FilterCondition],
    ) -> impl Future<Output = StoreResult<u64>> + Send;

    /// Apply `changes` to every matching row; returns the number of rows changed
    fn update(
        &self,
        handle: Handle<'_, Self::Session>,
        table: &str,
        filters: &[FilterCondition],
        changes: Record,
    ) -> impl Future<Output = StoreResult<u64>> + Send;

    /// Remove every matching row; returns the number of rows removed
    fn delete(
        &self,
        handle: Handle<'_, Self::Session>,
        table: &str,
        filters: &[FilterCondition],
    ) -> impl Future<Output = StoreResult<u64>> + Send;

    /// Run a statement the structured surface cannot express
    ///
    /// Statements that produce rows, including writes with a `RETURNING`
    /// clause, return those rows; anything else returns a single
    /// `{"rows_affected": n}` record.
    fn raw(
        &self,
        handle: Handle<'_, Self::Session>,
        statement: &str,
        params: Vec<Value>,
    ) -> impl Future<Output = StoreResult<Vec<Record>>> + Send;
}
