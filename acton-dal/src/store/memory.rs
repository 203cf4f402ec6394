//! In-process entity store
//!
//! Tables are vectors of JSON records behind a `tokio::sync::RwLock`. A
//! [`MemorySession`] takes a snapshot of every table on start, runs its
//! operations against the snapshot and journals them; commit replays the
//! journal onto a copy of the live tables and swaps the copy in only when
//! every entry applied cleanly. Rollback and release just drop the snapshot.
//!
//! Filters follow SQL null semantics: a comparison against a missing or null
//! column is false, only `IS NULL` matches it.
//!
//! # Example
//!
//! ```rust
//! use acton_dal::store::{IdStrategy, MemoryStore, TableSchema};
//!
//! let store = MemoryStore::builder()
//!     .table("orders", TableSchema::new().id_strategy(IdStrategy::Sequence).timestamps())
//!     .table("users", TableSchema::new().unique("email"))
//!     .build();
//! # let _ = store;
//! ```

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock, PoisonError};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace};
use uuid::Uuid;

use super::{EntityStore, Handle, Record, StoreResult};
use crate::error::{StoreError, StoreOperation};
use crate::repository::{
    FilterCondition, FilterOperator, FindOptions, OrderDirection, SessionState, SessionStateCell,
    TransactionSession, RELEASABLE,
};

/// How a table fills in a missing identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdStrategy {
    /// Random UUID v4 string
    #[default]
    Uuid,
    /// Increasing integer starting at 1
    Sequence,
    /// Caller supplies the identity
    Manual,
}

/// Per-table behavior of the memory store
#[derive(Debug, Clone)]
pub struct TableSchema {
    id_field: String,
    id_strategy: IdStrategy,
    defaults: Record,
    timestamps: bool,
    unique: Vec<String>,
}

impl Default for TableSchema {
    fn default() -> Self {
        Self {
            id_field: "id".to_string(),
            id_strategy: IdStrategy::default(),
            defaults: Record::new(),
            timestamps: false,
            unique: Vec::new(),
        }
    }
}

impl TableSchema {
    /// `id` column, UUID identities, no defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Name of the identity column
    #[must_use]
    pub fn id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    /// How missing identities are generated
    #[must_use]
    pub fn id_strategy(mut self, strategy: IdStrategy) -> Self {
        self.id_strategy = strategy;
        self
    }

    /// Value stored in `field` when an insert leaves it out
    #[must_use]
    pub fn default_value(mut self, field: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(field.into(), value);
        self
    }

    /// Stamp `created_at` on insert and `updated_at` on insert and update
    #[must_use]
    pub fn timestamps(mut self) -> Self {
        self.timestamps = true;
        self
    }

    /// Reject two rows sharing a non-null value in `field`
    #[must_use]
    pub fn unique(mut self, field: impl Into<String>) -> Self {
        self.unique.push(field.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
struct Table {
    rows: Vec<Record>,
}

/// Per-table sequence counters, shared by the live tables and every snapshot
///
/// Values are never handed out twice, even when they are drawn inside a
/// session that later rolls back.
#[derive(Debug, Default)]
struct Sequences(std::sync::Mutex<HashMap<String, i64>>);

impl Sequences {
    fn next(&self, table: &str) -> i64 {
        let mut counters = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        let counter = counters.entry(table.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    // keeps explicit integer ids from being handed out again
    fn observe(&self, table: &str, value: i64) {
        let mut counters = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        let counter = counters.entry(table.to_string()).or_insert(0);
        *counter = (*counter).max(value);
    }
}

/// A consistent view of every table, handed to raw statements
#[derive(Debug, Clone, Default)]
pub struct MemoryTables {
    tables: HashMap<String, Table>,
    schemas: Arc<HashMap<String, TableSchema>>,
    sequences: Arc<Sequences>,
}

/// A named read-only statement runnable through [`EntityStore::raw`]
pub type RawStatement = Arc<dyn Fn(&MemoryTables, &[Value]) -> StoreResult<Vec<Record>> + Send + Sync>;

static DEFAULT_SCHEMA: LazyLock<TableSchema> = LazyLock::new(TableSchema::default);

impl MemoryTables {
    fn schema(&self, table: &str) -> &TableSchema {
        self.schemas
            .get(table)
            .unwrap_or(&*DEFAULT_SCHEMA)
    }

    /// Every row of `table`, in insertion order
    pub fn rows(&self, table: &str) -> &[Record] {
        self.tables.get(table).map_or(&[], |t| t.rows.as_slice())
    }

    /// Rows matching `options`, ordered and sliced
    pub fn select(&self, table: &str, options: &FindOptions) -> StoreResult<Vec<Record>> {
        let mut matched = Vec::new();
        for row in self.rows(table) {
            if matches_all(row, &options.filters)? {
                matched.push(row.clone());
            }
        }

        if !options.order_by.is_empty() {
            matched.sort_by(|a, b| {
                for (field, direction) in &options.order_by {
                    let ordering = order_values(field_value(a, field), field_value(b, field));
                    let ordering = match direction {
                        OrderDirection::Ascending => ordering,
                        OrderDirection::Descending => ordering.reverse(),
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }

        Ok(match options.pagination {
            Some(page) => matched
                .into_iter()
                .skip(usize::try_from(page.offset).unwrap_or(usize::MAX))
                .take(usize::try_from(page.limit).unwrap_or(usize::MAX))
                .collect(),
            None => matched,
        })
    }

    /// Number of rows matching every filter
    pub fn count(&self, table: &str, filters: &[FilterCondition]) -> StoreResult<u64> {
        let mut total = 0;
        for row in self.rows(table) {
            if matches_all(row, filters)? {
                total += 1;
            }
        }
        Ok(total)
    }

    /// Fill in identities, defaults and timestamps without touching the table
    fn materialize(&self, table: &str, rows: Vec<Record>, now: DateTime<Utc>) -> StoreResult<Vec<Record>> {
        let schema = self.schema(table);
        let mut out = Vec::with_capacity(rows.len());

        for mut row in rows {
            for (field, value) in &schema.defaults {
                row.entry(field.clone()).or_insert_with(|| value.clone());
            }

            let missing_id = row.get(&schema.id_field).map_or(true, Value::is_null);
            if missing_id {
                let id = match schema.id_strategy {
                    IdStrategy::Uuid => Value::String(Uuid::new_v4().to_string()),
                    IdStrategy::Sequence => Value::from(self.sequences.next(table)),
                    IdStrategy::Manual => {
                        return Err(StoreError::constraint_violation(
                            StoreOperation::Insert,
                            format!("null value in column \"{}\"", schema.id_field),
                        )
                        .add_context(table));
                    }
                };
                row.insert(schema.id_field.clone(), id);
            }

            if schema.timestamps {
                let stamp = Value::String(now.to_rfc3339());
                row.entry("created_at").or_insert_with(|| stamp.clone());
                row.entry("updated_at").or_insert(stamp);
            }
            out.push(row);
        }
        Ok(out)
    }

    /// Append fully materialized rows, all or nothing
    fn insert_materialized(&mut self, table: &str, rows: &[Record]) -> StoreResult<()> {
        let schema = self.schema(table).clone();
        let existing = self.rows(table);

        for (i, row) in rows.iter().enumerate() {
            let others = existing.iter().chain(rows[..i].iter());
            check_unique(table, &schema, row, others, StoreOperation::Insert)?;
        }

        let entry = self.tables.entry(table.to_string()).or_default();
        for row in rows {
            if let Some(n) = row.get(&schema.id_field).and_then(Value::as_i64) {
                self.sequences.observe(table, n);
            }
            entry.rows.push(row.clone());
        }
        Ok(())
    }

    fn insert(&mut self, table: &str, rows: Vec<Record>, now: DateTime<Utc>) -> StoreResult<Vec<Record>> {
        let rows = self.materialize(table, rows, now)?;
        self.insert_materialized(table, &rows)?;
        Ok(rows)
    }

    fn update(
        &mut self,
        table: &str,
        filters: &[FilterCondition],
        changes: &Record,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let schema = self.schema(table).clone();
        let current = self.rows(table);

        let mut next = current.to_vec();
        let mut touched = Vec::new();
        for (i, row) in current.iter().enumerate() {
            if !matches_all(row, filters)? {
                continue;
            }
            let updated = &mut next[i];
            for (field, value) in changes {
                updated.insert(field.clone(), value.clone());
            }
            if schema.timestamps {
                updated.insert("updated_at".to_string(), Value::String(now.to_rfc3339()));
            }
            touched.push(i);
        }

        for &i in &touched {
            let others = next
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, row)| row);
            check_unique(table, &schema, &next[i], others, StoreOperation::Update)?;
        }

        if !touched.is_empty() {
            self.tables.entry(table.to_string()).or_default().rows = next;
        }
        Ok(touched.len() as u64)
    }

    fn delete(&mut self, table: &str, filters: &[FilterCondition]) -> StoreResult<u64> {
        let Some(entry) = self.tables.get_mut(table) else {
            return Ok(0);
        };
        let mut doomed = Vec::with_capacity(entry.rows.len());
        for row in &entry.rows {
            doomed.push(matches_all(row, filters)?);
        }
        let before = entry.rows.len();
        let mut doomed = doomed.into_iter();
        entry.rows.retain(|_| !doomed.next().unwrap_or(false));
        Ok((before - entry.rows.len()) as u64)
    }
}

fn check_unique<'a>(
    table: &str,
    schema: &TableSchema,
    row: &Record,
    others: impl Iterator<Item = &'a Record> + Clone,
    operation: StoreOperation,
) -> StoreResult<()> {
    let columns = std::iter::once(&schema.id_field).chain(schema.unique.iter());
    for column in columns {
        let value = field_value(row, column);
        if value.is_null() {
            continue;
        }
        if others.clone().any(|other| json_eq(field_value(other, column), value)) {
            return Err(StoreError::constraint_violation(
                operation,
                format!("duplicate key value violates unique constraint on \"{}\"", column),
            )
            .add_context(table));
        }
    }
    Ok(())
}

static NULL: Value = Value::Null;

fn field_value<'a>(row: &'a Record, field: &str) -> &'a Value {
    row.get(field).unwrap_or(&NULL)
}

fn matches_all(row: &Record, filters: &[FilterCondition]) -> StoreResult<bool> {
    for condition in filters {
        if !matches(row, condition)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn matches(row: &Record, condition: &FilterCondition) -> StoreResult<bool> {
    let value = field_value(row, &condition.field);
    let target = condition.value.to_json();

    let comparable = !value.is_null() && !target.is_null();

    Ok(match condition.operator {
        FilterOperator::IsNull => value.is_null(),
        FilterOperator::IsNotNull => !value.is_null(),
        _ if !comparable => false,
        FilterOperator::Equal => json_eq(value, &target),
        FilterOperator::NotEqual => !json_eq(value, &target),
        FilterOperator::GreaterThan => compare(value, &target) == Some(Ordering::Greater),
        FilterOperator::GreaterThanOrEqual => matches!(
            compare(value, &target),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOperator::LessThan => compare(value, &target) == Some(Ordering::Less),
        FilterOperator::LessThanOrEqual => {
            matches!(compare(value, &target), Some(Ordering::Less | Ordering::Equal))
        }
        FilterOperator::Like => {
            let (Value::String(text), Value::String(pattern)) = (value, &target) else {
                return Ok(false);
            };
            like_regex(pattern)?.is_match(text)
        }
        FilterOperator::In => match &target {
            Value::Array(items) => items.iter().any(|item| json_eq(value, item)),
            _ => {
                return Err(StoreError::invalid_input(
                    StoreOperation::Select,
                    format!("IN on \"{}\" needs a list", condition.field),
                ))
            }
        },
    })
}

fn like_regex(pattern: &str) -> StoreResult<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push_str("(?s)^");
    for c in pattern.chars() {
        match c {
            '%' => expr.push_str(".*"),
            '_' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr)
        .map_err(|e| StoreError::invalid_input(StoreOperation::Select, e.to_string()))
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

// nulls sort last ascending, like PostgreSQL
fn order_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Bool(_) => 0,
            Value::Number(_) => 1,
            Value::String(_) => 2,
            Value::Array(_) => 3,
            Value::Object(_) => 4,
            Value::Null => 5,
        }
    }
    rank(a)
        .cmp(&rank(b))
        .then_with(|| compare(a, b).unwrap_or(Ordering::Equal))
}

#[derive(Debug, Clone)]
enum JournalEntry {
    Insert {
        table: String,
        rows: Vec<Record>,
    },
    Update {
        table: String,
        filters: Vec<FilterCondition>,
        changes: Record,
        at: DateTime<Utc>,
    },
    Delete {
        table: String,
        filters: Vec<FilterCondition>,
    },
}

impl JournalEntry {
    fn replay(&self, tables: &mut MemoryTables) -> StoreResult<()> {
        match self {
            Self::Insert { table, rows } => tables.insert_materialized(table, rows),
            Self::Update {
                table,
                filters,
                changes,
                at,
            } => tables.update(table, filters, changes, *at).map(|_| ()),
            Self::Delete { table, filters } => tables.delete(table, filters).map(|_| ()),
        }
    }
}

struct Inner {
    tables: RwLock<MemoryTables>,
    statements: HashMap<String, RawStatement>,
}

/// Builder for a [`MemoryStore`]
#[derive(Default)]
pub struct MemoryStoreBuilder {
    schemas: HashMap<String, TableSchema>,
    statements: HashMap<String, RawStatement>,
}

impl MemoryStoreBuilder {
    /// Declare how `name` generates identities, defaults and constraints
    ///
    /// Undeclared tables are created on first insert with the default schema.
    #[must_use]
    pub fn table(mut self, name: impl Into<String>, schema: TableSchema) -> Self {
        self.schemas.insert(name.into(), schema);
        self
    }

    /// Register a named statement for [`EntityStore::raw`]
    #[must_use]
    pub fn statement<F>(mut self, name: impl Into<String>, statement: F) -> Self
    where
        F: Fn(&MemoryTables, &[Value]) -> StoreResult<Vec<Record>> + Send + Sync + 'static,
    {
        self.statements.insert(name.into(), Arc::new(statement));
        self
    }

    /// Finish building
    pub fn build(self) -> MemoryStore {
        let tables = MemoryTables {
            tables: HashMap::new(),
            schemas: Arc::new(self.schemas),
            sequences: Arc::default(),
        };
        MemoryStore {
            inner: Arc::new(Inner {
                tables: RwLock::new(tables),
                statements: self.statements,
            }),
        }
    }
}

/// In-process [`EntityStore`]; clones share the same tables
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("statements", &self.inner.statements.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A store with no declared tables or statements
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start configuring a store
    pub fn builder() -> MemoryStoreBuilder {
        MemoryStoreBuilder::default()
    }

    /// Copy of the committed state of every table
    pub async fn snapshot(&self) -> MemoryTables {
        self.inner.tables.read().await.clone()
    }

    fn owns(&self, session: &MemorySession) -> StoreResult<()> {
        if Arc::ptr_eq(&self.inner, &session.store.inner) {
            Ok(())
        } else {
            Err(StoreError::invalid_input(
                StoreOperation::Transaction,
                "session belongs to a different store",
            ))
        }
    }

    /// Run a read against whichever tables `handle` points at
    async fn read<R>(
        &self,
        handle: Handle<'_, MemorySession>,
        f: impl FnOnce(&MemoryTables) -> StoreResult<R>,
    ) -> StoreResult<R> {
        match handle {
            Handle::Default => {
                let tables = self.inner.tables.read().await;
                f(&tables)
            }
            Handle::Session(session) => {
                self.owns(session)?;
                session.state.expect_active()?;
                let data = session.data.lock().await;
                let tables = data.snapshot.as_ref().ok_or_else(no_snapshot)?;
                f(tables)
            }
        }
    }

    /// Run a write; session writes are journaled for replay on commit
    async fn write<R>(
        &self,
        handle: Handle<'_, MemorySession>,
        f: impl FnOnce(&mut MemoryTables) -> StoreResult<(R, Option<JournalEntry>)>,
    ) -> StoreResult<R> {
        match handle {
            Handle::Default => {
                let mut tables = self.inner.tables.write().await;
                f(&mut tables).map(|(result, _)| result)
            }
            Handle::Session(session) => {
                self.owns(session)?;
                session.state.expect_active()?;
                let mut data = session.data.lock().await;
                let tables = data.snapshot.as_mut().ok_or_else(no_snapshot)?;
                let (result, entry) = f(tables)?;
                if let Some(entry) = entry {
                    data.journal.push(entry);
                }
                Ok(result)
            }
        }
    }
}

fn no_snapshot() -> StoreError {
    StoreError::transaction_failed("session has no active snapshot")
}

impl EntityStore for MemoryStore {
    type Session = MemorySession;

    fn session(&self) -> MemorySession {
        MemorySession {
            store: self.clone(),
            data: Arc::new(Mutex::new(SessionData::default())),
            state: SessionStateCell::new(),
        }
    }

    async fn insert(
        &self,
        handle: Handle<'_, MemorySession>,
        table: &str,
        rows: Vec<Record>,
    ) -> StoreResult<Vec<Record>> {
        trace!(table, rows = rows.len(), session = handle.is_session(), "memory insert");
        let now = Utc::now();
        self.write(handle, |tables| {
            let inserted = tables.insert(table, rows, now)?;
            let entry = JournalEntry::Insert {
                table: table.to_string(),
                rows: inserted.clone(),
            };
            Ok((inserted, Some(entry)))
        })
        .await
    }

    async fn find(
        &self,
        handle: Handle<'_, MemorySession>,
        table: &str,
        options: &FindOptions,
    ) -> StoreResult<Vec<Record>> {
        self.read(handle, |tables| tables.select(table, options)).await
    }

    async fn count(
        &self,
        handle: Handle<'_, MemorySession>,
        table: &str,
        filters: &[FilterCondition],
    ) -> StoreResult<u64> {
        self.read(handle, |tables| tables.count(table, filters)).await
    }

    async fn update(
        &self,
        handle: Handle<'_, MemorySession>,
        table: &str,
        filters: &[FilterCondition],
        changes: Record,
    ) -> StoreResult<u64> {
        let at = Utc::now();
        self.write(handle, |tables| {
            let changed = tables.update(table, filters, &changes, at)?;
            let entry = (changed > 0).then(|| JournalEntry::Update {
                table: table.to_string(),
                filters: filters.to_vec(),
                changes,
                at,
            });
            Ok((changed, entry))
        })
        .await
    }

    async fn delete(
        &self,
        handle: Handle<'_, MemorySession>,
        table: &str,
        filters: &[FilterCondition],
    ) -> StoreResult<u64> {
        self.write(handle, |tables| {
            let removed = tables.delete(table, filters)?;
            let entry = (removed > 0).then(|| JournalEntry::Delete {
                table: table.to_string(),
                filters: filters.to_vec(),
            });
            Ok((removed, entry))
        })
        .await
    }

    async fn raw(
        &self,
        handle: Handle<'_, MemorySession>,
        statement: &str,
        params: Vec<Value>,
    ) -> StoreResult<Vec<Record>> {
        let Some(run) = self.inner.statements.get(statement).cloned() else {
            return Err(StoreError::unsupported(
                StoreOperation::Raw,
                format!("no statement registered as \"{}\"", statement),
            ));
        };
        self.read(handle, |tables| run(tables, &params)).await
    }
}

#[derive(Default)]
struct SessionData {
    snapshot: Option<MemoryTables>,
    journal: Vec<JournalEntry>,
}

/// Snapshot transaction over a [`MemoryStore`]
#[derive(Clone)]
pub struct MemorySession {
    store: MemoryStore,
    data: Arc<Mutex<SessionData>>,
    state: SessionStateCell,
}

impl fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySession")
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl TransactionSession for MemorySession {
    async fn start(&self) -> StoreResult<()> {
        self.state
            .expect(&[SessionState::NotStarted], "start")?;
        let snapshot = self.store.snapshot().await;
        {
            let mut data = self.data.lock().await;
            data.snapshot = Some(snapshot);
            data.journal.clear();
        }
        self.state
            .transition(&[SessionState::NotStarted], SessionState::Active, "start")?;
        debug!("memory session started");
        Ok(())
    }

    async fn commit(&self) -> StoreResult<()> {
        self.state.expect_active()?;
        let mut data = self.data.lock().await;
        {
            let mut live = self.store.inner.tables.write().await;
            let mut next = live.clone();
            for entry in &data.journal {
                entry
                    .replay(&mut next)
                    .map_err(|e| e.add_context("commit"))?;
            }
            *live = next;
        }
        debug!(entries = data.journal.len(), "memory session committed");
        data.snapshot = None;
        data.journal.clear();
        self.state
            .transition(&[SessionState::Active], SessionState::Committed, "commit")
    }

    async fn rollback(&self) -> StoreResult<()> {
        self.state
            .transition(&[SessionState::Active], SessionState::RolledBack, "rollback")?;
        let mut data = self.data.lock().await;
        debug!(entries = data.journal.len(), "memory session rolled back");
        data.snapshot = None;
        data.journal.clear();
        Ok(())
    }

    async fn release(&self) -> StoreResult<()> {
        self.state
            .transition(RELEASABLE, SessionState::Released, "release")?;
        let mut data = self.data.lock().await;
        data.snapshot = None;
        data.journal.clear();
        Ok(())
    }

    fn state(&self) -> SessionState {
        self.state.get()
    }
}
