//! PostgreSQL entity store
//!
//! Rows travel as `jsonb`: selects return `to_jsonb(row)`, inserts and updates
//! go through `jsonb_populate_record` so the database does the type coercion
//! and omitted columns keep their defaults. Filters compare the bare column
//! against a bound `jsonb` value cast to the column's own type through the
//! same `jsonb_populate_record`, so indexes on the column stay usable. Table
//! and column names are validated before they are interpolated; values are
//! always bound.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPool};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::{EntityStore, Handle, Record, StoreResult};
use crate::config::DatabaseConfig;
use crate::database::create_pool;
use crate::error::{StoreError, StoreOperation};
use crate::repository::{
    FilterCondition, FilterOperator, FindOptions, OrderDirection, SessionState, SessionStateCell,
    TransactionSession, RELEASABLE,
};

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
        .expect("identifier regex is valid")
});

static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'(?:[^']|'')*'").expect("string literal regex is valid"));

static RETURNING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bRETURNING\b").expect("returning regex is valid"));

/// Quote a table or column name, optionally schema-qualified
fn quote(ident: &str, operation: StoreOperation) -> StoreResult<String> {
    if !IDENTIFIER.is_match(ident) {
        return Err(StoreError::invalid_input(
            operation,
            format!("invalid identifier \"{}\"", ident),
        ));
    }
    Ok(ident
        .split('.')
        .map(|part| format!("\"{}\"", part))
        .collect::<Vec<_>>()
        .join("."))
}

fn to_i64(n: u64, operation: StoreOperation) -> StoreResult<i64> {
    i64::try_from(n).map_err(|_| StoreError::invalid_input(operation, format!("{} is out of range", n)))
}

/// Append `WHERE` predicates for `filters` on rows of `table` aliased `r`
///
/// `table` must already be quoted.
fn push_where(
    qb: &mut QueryBuilder<'static, Postgres>,
    table: &str,
    filters: &[FilterCondition],
    operation: StoreOperation,
) -> StoreResult<()> {
    for (i, condition) in filters.iter().enumerate() {
        qb.push(if i == 0 { " WHERE " } else { " AND " });
        let quoted = quote(&condition.field, operation)?;
        let column = format!("r.{}", quoted);
        match condition.operator {
            FilterOperator::IsNull => {
                qb.push(column).push(" IS NULL");
            }
            FilterOperator::IsNotNull => {
                qb.push(column).push(" IS NOT NULL");
            }
            FilterOperator::Like => {
                let Value::String(pattern) = condition.value.to_json() else {
                    return Err(StoreError::invalid_input(
                        operation,
                        format!("LIKE on \"{}\" needs a string pattern", condition.field),
                    ));
                };
                qb.push(column).push("::text LIKE ").push_bind(pattern);
            }
            FilterOperator::In => {
                let list = condition.value.to_json();
                if !list.is_array() {
                    return Err(StoreError::invalid_input(
                        operation,
                        format!("IN on \"{}\" needs a list", condition.field),
                    ));
                }
                // field names passed quote(), so the literal cannot break out
                qb.push(format!(
                    "{column} = ANY (ARRAY(SELECT (jsonb_populate_record(NULL::{table}, \
                     jsonb_build_object('{}', e))).{quoted} FROM jsonb_array_elements(",
                    condition.field
                ))
                .push_bind(Json(list))
                .push(") AS e))");
            }
            op => {
                let sql_op = match op {
                    FilterOperator::NotEqual => "<>".to_string(),
                    other => other.to_string(),
                };
                let mut operand = Record::new();
                operand.insert(condition.field.clone(), condition.value.to_json());
                qb.push(format!("{column} {sql_op} (jsonb_populate_record(NULL::{table}, "))
                    .push_bind(Json(Value::Object(operand)))
                    .push(format!(")).{quoted}"));
            }
        }
    }
    Ok(())
}

fn select_sql(table: &str, options: &FindOptions) -> StoreResult<QueryBuilder<'static, Postgres>> {
    let op = StoreOperation::Select;
    let table = quote(table, op)?;
    let mut qb = QueryBuilder::new(format!("SELECT to_jsonb(r) FROM {} AS r", table));
    push_where(&mut qb, &table, &options.filters, op)?;

    for (i, (field, direction)) in options.order_by.iter().enumerate() {
        qb.push(if i == 0 { " ORDER BY " } else { ", " });
        qb.push(format!("r.{}", quote(field, op)?));
        qb.push(match direction {
            OrderDirection::Ascending => " ASC",
            OrderDirection::Descending => " DESC",
        });
    }

    if let Some(page) = options.pagination {
        qb.push(" LIMIT ").push_bind(to_i64(page.limit, op)?);
        qb.push(" OFFSET ").push_bind(to_i64(page.offset, op)?);
    }
    Ok(qb)
}

fn count_sql(table: &str, filters: &[FilterCondition]) -> StoreResult<QueryBuilder<'static, Postgres>> {
    let op = StoreOperation::Count;
    let table = quote(table, op)?;
    let mut qb = QueryBuilder::new(format!("SELECT COUNT(*) FROM {} AS r", table));
    push_where(&mut qb, &table, filters, op)?;
    Ok(qb)
}

fn insert_sql(table: &str, row: Record) -> StoreResult<QueryBuilder<'static, Postgres>> {
    let op = StoreOperation::Insert;
    let table = quote(table, op)?;
    if row.is_empty() {
        return Ok(QueryBuilder::new(format!(
            "INSERT INTO {} AS r DEFAULT VALUES RETURNING to_jsonb(r)",
            table
        )));
    }

    let columns = row
        .keys()
        .map(|k| quote(k, op))
        .collect::<StoreResult<Vec<_>>>()?
        .join(", ");
    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {table} AS r ({columns}) SELECT {columns} FROM jsonb_populate_record(NULL::{table}, "
    ));
    qb.push_bind(Json(Value::Object(row)))
        .push(") RETURNING to_jsonb(r)");
    Ok(qb)
}

fn update_sql(
    table: &str,
    filters: &[FilterCondition],
    changes: Record,
) -> StoreResult<QueryBuilder<'static, Postgres>> {
    let op = StoreOperation::Update;
    if changes.is_empty() {
        return Err(StoreError::invalid_input(op, "update without changes"));
    }
    let table = quote(table, op)?;
    let assignments = changes
        .keys()
        .map(|k| quote(k, op).map(|col| format!("{col} = p.{col}")))
        .collect::<StoreResult<Vec<_>>>()?
        .join(", ");

    let mut qb = QueryBuilder::new(format!(
        "UPDATE {table} AS r SET {assignments} FROM jsonb_populate_record(NULL::{table}, "
    ));
    qb.push_bind(Json(Value::Object(changes))).push(") AS p");
    push_where(&mut qb, &table, filters, op)?;
    Ok(qb)
}

fn delete_sql(table: &str, filters: &[FilterCondition]) -> StoreResult<QueryBuilder<'static, Postgres>> {
    let op = StoreOperation::Delete;
    let table = quote(table, op)?;
    let mut qb = QueryBuilder::new(format!("DELETE FROM {} AS r", table));
    push_where(&mut qb, &table, filters, op)?;
    Ok(qb)
}

fn is_query(statement: &str) -> bool {
    let head = statement.trim_start().to_ascii_uppercase();
    head.starts_with("SELECT") || head.starts_with("WITH") || head.starts_with("VALUES")
}

/// A write whose `RETURNING` clause sits outside any string literal
fn has_returning(statement: &str) -> bool {
    RETURNING.is_match(&STRING_LITERAL.replace_all(statement, "''"))
}

/// Wrap a row-producing statement so each row comes back as one `jsonb` value
///
/// `None` for statements that only report an affected-row count.
fn rows_sql(statement: &str) -> Option<String> {
    if is_query(statement) {
        Some(format!("SELECT to_jsonb(q) FROM ({}) AS q", statement))
    } else if has_returning(statement) {
        // data-modifying statements may only appear in a top-level WITH
        Some(format!("WITH q AS ({}) SELECT to_jsonb(q) FROM q", statement))
    } else {
        None
    }
}

fn bind_param(query: Query<'_, Postgres, PgArguments>, value: Value) -> Query<'_, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s),
        other => query.bind(Json(other)),
    }
}

fn into_record(value: Value, operation: StoreOperation) -> StoreResult<Record> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::type_conversion(
            operation,
            format!("expected a row object, got {}", other),
        )),
    }
}

fn sql_error(err: sqlx::Error, operation: StoreOperation) -> StoreError {
    let mut err = StoreError::from(err);
    err.operation = operation;
    err
}

/// [`EntityStore`] over a PostgreSQL pool
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a pool from configuration (with retries) and wrap it
    pub async fn connect(config: &DatabaseConfig) -> crate::error::Result<Self> {
        Ok(Self::new(create_pool(config).await?))
    }

    /// The underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_rows(
        &self,
        handle: Handle<'_, PgSession>,
        mut qb: QueryBuilder<'static, Postgres>,
        operation: StoreOperation,
    ) -> StoreResult<Vec<Record>> {
        trace!(sql = qb.sql(), "pg fetch");
        let query = qb.build_query_scalar::<Json<Value>>();
        let rows = match handle {
            Handle::Default => query.fetch_all(&self.pool).await,
            Handle::Session(session) => {
                let mut guard = session.active_tx().await?;
                let tx = guard.as_mut().ok_or_else(no_transaction)?;
                query.fetch_all(&mut **tx).await
            }
        }
        .map_err(|e| sql_error(e, operation))?;

        rows.into_iter()
            .map(|Json(value)| into_record(value, operation))
            .collect()
    }

    async fn execute(
        &self,
        handle: Handle<'_, PgSession>,
        mut qb: QueryBuilder<'static, Postgres>,
        operation: StoreOperation,
    ) -> StoreResult<u64> {
        trace!(sql = qb.sql(), "pg execute");
        let query = qb.build();
        let result = match handle {
            Handle::Default => query.execute(&self.pool).await,
            Handle::Session(session) => {
                let mut guard = session.active_tx().await?;
                let tx = guard.as_mut().ok_or_else(no_transaction)?;
                query.execute(&mut **tx).await
            }
        }
        .map_err(|e| sql_error(e, operation))?;
        Ok(result.rows_affected())
    }
}

impl EntityStore for PgStore {
    type Session = PgSession;

    fn session(&self) -> PgSession {
        PgSession {
            pool: self.pool.clone(),
            tx: Arc::new(Mutex::new(None)),
            state: SessionStateCell::new(),
        }
    }

    async fn insert(
        &self,
        handle: Handle<'_, PgSession>,
        table: &str,
        rows: Vec<Record>,
    ) -> StoreResult<Vec<Record>> {
        let op = StoreOperation::Insert;
        let statements = rows
            .into_iter()
            .map(|row| insert_sql(table, row))
            .collect::<StoreResult<Vec<_>>>()?;

        // a multi-row batch on the default connection gets its own transaction
        if statements.len() > 1 && !handle.is_session() {
            let mut tx = self.pool.begin().await.map_err(|e| sql_error(e, op))?;
            let mut inserted = Vec::with_capacity(statements.len());
            for mut qb in statements {
                let Json(value) = qb
                    .build_query_scalar::<Json<Value>>()
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| sql_error(e, op))?;
                inserted.push(into_record(value, op)?);
            }
            tx.commit().await.map_err(|e| sql_error(e, op))?;
            return Ok(inserted);
        }

        let mut inserted = Vec::with_capacity(statements.len());
        for qb in statements {
            let mut rows = self.fetch_rows(handle, qb, op).await?;
            let row = rows
                .pop()
                .ok_or_else(|| StoreError::query_failed(op, "insert returned no row").add_context(table))?;
            inserted.push(row);
        }
        Ok(inserted)
    }

    async fn find(
        &self,
        handle: Handle<'_, PgSession>,
        table: &str,
        options: &FindOptions,
    ) -> StoreResult<Vec<Record>> {
        if !options.relations.is_empty() {
            trace!(relations = ?options.relations, "relation loading is not supported by the pg store");
        }
        let qb = select_sql(table, options)?;
        self.fetch_rows(handle, qb, StoreOperation::Select).await
    }

    async fn count(
        &self,
        handle: Handle<'_, PgSession>,
        table: &str,
        filters: &[FilterCondition],
    ) -> StoreResult<u64> {
        let op = StoreOperation::Count;
        let mut qb = count_sql(table, filters)?;
        let query = qb.build_query_scalar::<i64>();
        let total = match handle {
            Handle::Default => query.fetch_one(&self.pool).await,
            Handle::Session(session) => {
                let mut guard = session.active_tx().await?;
                let tx = guard.as_mut().ok_or_else(no_transaction)?;
                query.fetch_one(&mut **tx).await
            }
        }
        .map_err(|e| sql_error(e, op))?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    async fn update(
        &self,
        handle: Handle<'_, PgSession>,
        table: &str,
        filters: &[FilterCondition],
        changes: Record,
    ) -> StoreResult<u64> {
        let qb = update_sql(table, filters, changes)?;
        self.execute(handle, qb, StoreOperation::Update).await
    }

    async fn delete(
        &self,
        handle: Handle<'_, PgSession>,
        table: &str,
        filters: &[FilterCondition],
    ) -> StoreResult<u64> {
        let qb = delete_sql(table, filters)?;
        self.execute(handle, qb, StoreOperation::Delete).await
    }

    async fn raw(
        &self,
        handle: Handle<'_, PgSession>,
        statement: &str,
        params: Vec<Value>,
    ) -> StoreResult<Vec<Record>> {
        let op = StoreOperation::Raw;
        debug!(params = params.len(), "pg raw statement");

        if let Some(sql) = rows_sql(statement) {
            let query = params
                .into_iter()
                .fold(sqlx::query(&sql), bind_param);
            let rows = match handle {
                Handle::Default => query.fetch_all(&self.pool).await,
                Handle::Session(session) => {
                    let mut guard = session.active_tx().await?;
                    let tx = guard.as_mut().ok_or_else(no_transaction)?;
                    query.fetch_all(&mut **tx).await
                }
            }
            .map_err(|e| sql_error(e, op))?;

            return rows
                .iter()
                .map(|row| {
                    let Json(value) = row
                        .try_get::<Json<Value>, _>(0)
                        .map_err(|e| sql_error(e, op))?;
                    into_record(value, op)
                })
                .collect();
        }

        let query = params.into_iter().fold(sqlx::query(statement), bind_param);
        let result = match handle {
            Handle::Default => query.execute(&self.pool).await,
            Handle::Session(session) => {
                let mut guard = session.active_tx().await?;
                let tx = guard.as_mut().ok_or_else(no_transaction)?;
                query.execute(&mut **tx).await
            }
        }
        .map_err(|e| sql_error(e, op))?;

        let mut record = Record::new();
        record.insert("rows_affected".to_string(), Value::from(result.rows_affected()));
        Ok(vec![record])
    }
}

fn no_transaction() -> StoreError {
    StoreError::transaction_failed("session has no open transaction")
}

fn tx_error(err: sqlx::Error, action: &str) -> StoreError {
    sql_error(err, StoreOperation::Transaction).add_context(action)
}

/// A PostgreSQL transaction, opened on [`start`](TransactionSession::start)
#[derive(Clone)]
pub struct PgSession {
    pool: PgPool,
    tx: Arc<Mutex<Option<Transaction<'static, Postgres>>>>,
    state: SessionStateCell,
}

impl std::fmt::Debug for PgSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSession")
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl PgSession {
    async fn active_tx(
        &self,
    ) -> StoreResult<tokio::sync::MutexGuard<'_, Option<Transaction<'static, Postgres>>>> {
        self.state.expect_active()?;
        Ok(self.tx.lock().await)
    }
}

impl TransactionSession for PgSession {
    async fn start(&self) -> StoreResult<()> {
        self.state.expect(&[SessionState::NotStarted], "start")?;
        let tx = self.pool.begin().await.map_err(|e| tx_error(e, "begin"))?;
        *self.tx.lock().await = Some(tx);
        self.state
            .transition(&[SessionState::NotStarted], SessionState::Active, "start")?;
        debug!("pg transaction started");
        Ok(())
    }

    async fn commit(&self) -> StoreResult<()> {
        self.state.expect_active()?;
        let tx = self.tx.lock().await.take().ok_or_else(no_transaction)?;
        tx.commit().await.map_err(|e| tx_error(e, "commit"))?;
        self.state
            .transition(&[SessionState::Active], SessionState::Committed, "commit")?;
        debug!("pg transaction committed");
        Ok(())
    }

    async fn rollback(&self) -> StoreResult<()> {
        self.state
            .transition(&[SessionState::Active], SessionState::RolledBack, "rollback")?;
        // a failed commit has already consumed the transaction
        let tx = self.tx.lock().await.take();
        if let Some(tx) = tx {
            tx.rollback().await.map_err(|e| tx_error(e, "rollback"))?;
        }
        debug!("pg transaction rolled back");
        Ok(())
    }

    async fn release(&self) -> StoreResult<()> {
        self.state
            .transition(RELEASABLE, SessionState::Released, "release")?;
        // dropping an open transaction rolls it back and returns the connection
        drop(self.tx.lock().await.take());
        Ok(())
    }

    fn state(&self) -> SessionState {
        self.state.get()
    }
}
