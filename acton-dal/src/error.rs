//! Error types for the data access layer
//!
//! Two layers of errors exist:
//!
//! - [`StoreError`]: raised by an [`EntityStore`](crate::store::EntityStore)
//!   adapter, describing what the engine did wrong.
//! - [`RepositoryError`](crate::repository::RepositoryError): what callers of
//!   the generic repository see, tagged with the failing repository operation.
//!
//! [`Error`] is the crate-level error used by configuration loading, pool
//! creation and tracing setup.

use std::fmt;
use thiserror::Error;

use crate::repository::RepositoryError;

// ============================================================================
// Structured Store Errors
// ============================================================================

/// Store operation being performed when the error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    /// Establishing a database connection
    Connect,
    /// Inserting records
    Insert,
    /// Selecting records
    Select,
    /// Counting records
    Count,
    /// Updating records
    Update,
    /// Deleting records
    Delete,
    /// Executing a raw statement
    Raw,
    /// Transaction operations (start, commit, rollback, release)
    Transaction,
    /// Acquiring a connection from the pool
    PoolAcquire,
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Insert => write!(f, "insert"),
            Self::Select => write!(f, "select"),
            Self::Count => write!(f, "count"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Raw => write!(f, "raw"),
            Self::Transaction => write!(f, "transaction"),
            Self::PoolAcquire => write!(f, "pool_acquire"),
        }
    }
}

/// Category of store error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    /// Failed to establish connection
    ConnectionFailed,
    /// Constraint violation (unique, foreign key, check)
    ConstraintViolation,
    /// Query execution failed
    QueryFailed,
    /// Transaction failed (start, commit, rollback or release)
    TransactionFailed,
    /// Type conversion error
    TypeConversion,
    /// Configuration error
    Configuration,
    /// Operation timed out
    Timeout,
    /// Connection pool exhausted
    PoolExhausted,
    /// Input the adapter refuses to send to the engine (e.g. a bad identifier)
    InvalidInput,
    /// The adapter does not support the requested statement
    Unsupported,
    /// Other/unknown error
    Other,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed => write!(f, "connection_failed"),
            Self::ConstraintViolation => write!(f, "constraint_violation"),
            Self::QueryFailed => write!(f, "query_failed"),
            Self::TransactionFailed => write!(f, "transaction_failed"),
            Self::TypeConversion => write!(f, "type_conversion"),
            Self::Configuration => write!(f, "configuration"),
            Self::Timeout => write!(f, "timeout"),
            Self::PoolExhausted => write!(f, "pool_exhausted"),
            Self::InvalidInput => write!(f, "invalid_input"),
            Self::Unsupported => write!(f, "unsupported"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Structured store error with operation context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    /// The operation being performed when the error occurred
    pub operation: StoreOperation,
    /// The category of error
    pub kind: StoreErrorKind,
    /// Human-readable error message
    pub message: String,
    /// Additional context (e.g., table name, statement name)
    pub context: Option<String>,
}

impl StoreError {
    /// Create a new store error
    pub fn new(operation: StoreOperation, kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
            context: None,
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(
            StoreOperation::Connect,
            StoreErrorKind::ConnectionFailed,
            message,
        )
    }

    /// Create a constraint violation error
    pub fn constraint_violation(operation: StoreOperation, message: impl Into<String>) -> Self {
        Self::new(operation, StoreErrorKind::ConstraintViolation, message)
    }

    /// Create a query failed error
    pub fn query_failed(operation: StoreOperation, message: impl Into<String>) -> Self {
        Self::new(operation, StoreErrorKind::QueryFailed, message)
    }

    /// Create a pool exhausted error
    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::new(
            StoreOperation::PoolAcquire,
            StoreErrorKind::PoolExhausted,
            message,
        )
    }

    /// Create a transaction failed error
    pub fn transaction_failed(message: impl Into<String>) -> Self {
        Self::new(
            StoreOperation::Transaction,
            StoreErrorKind::TransactionFailed,
            message,
        )
    }

    /// Create an invalid input error
    pub fn invalid_input(operation: StoreOperation, message: impl Into<String>) -> Self {
        Self::new(operation, StoreErrorKind::InvalidInput, message)
    }

    /// Create an unsupported statement error
    pub fn unsupported(operation: StoreOperation, message: impl Into<String>) -> Self {
        Self::new(operation, StoreErrorKind::Unsupported, message)
    }

    /// Create a type conversion error
    pub fn type_conversion(operation: StoreOperation, message: impl Into<String>) -> Self {
        Self::new(operation, StoreErrorKind::TypeConversion, message)
    }

    /// Check if this error is retriable (transient errors that may succeed on retry)
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind,
            StoreErrorKind::ConnectionFailed
                | StoreErrorKind::Timeout
                | StoreErrorKind::PoolExhausted
        )
    }

    /// Add context to an existing error
    #[must_use]
    pub fn add_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Store {} error during {}: {}",
            self.kind, self.operation, self.message
        )?;
        if let Some(ref ctx) = self.context {
            write!(f, " [context: {}]", ctx)?;
        }
        Ok(())
    }
}

impl std::error::Error for StoreError {}

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate
///
/// Large error variants are boxed to reduce stack size
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Repository error surfaced outside a repository call
    #[error("{0}")]
    Repository(#[from] RepositoryError),

    /// Structured store error with operation context
    #[error("{0}")]
    Store(#[from] StoreError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

// Conversion from sqlx::Error to StoreError
#[cfg(feature = "database")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error as E;
        match err {
            E::RowNotFound => Self::query_failed(StoreOperation::Select, "Row not found"),
            E::PoolTimedOut => Self::pool_exhausted("Connection pool timed out"),
            E::PoolClosed => Self::connection_failed("Connection pool is closed"),
            E::Protocol(msg) => Self::query_failed(StoreOperation::Select, msg),
            E::Configuration(e) => Self::new(
                StoreOperation::Connect,
                StoreErrorKind::Configuration,
                e.to_string(),
            ),
            E::Io(e) => Self::connection_failed(e.to_string()),
            E::Tls(e) => Self::connection_failed(format!("TLS error: {}", e)),
            E::TypeNotFound { type_name } => Self::type_conversion(
                StoreOperation::Select,
                format!("Type not found: {}", type_name),
            ),
            E::ColumnNotFound(col) => Self::query_failed(
                StoreOperation::Select,
                format!("Column not found: {}", col),
            ),
            E::ColumnDecode { index, source } => Self::type_conversion(
                StoreOperation::Select,
                format!("Failed to decode column {}: {}", index, source),
            ),
            E::Decode(e) => Self::type_conversion(StoreOperation::Select, e.to_string()),
            E::Database(db_err) => {
                let kind = if db_err.is_unique_violation()
                    || db_err.is_foreign_key_violation()
                    || db_err.is_check_violation()
                {
                    StoreErrorKind::ConstraintViolation
                } else {
                    StoreErrorKind::QueryFailed
                };
                Self::new(StoreOperation::Select, kind, db_err.to_string())
            }
            E::WorkerCrashed => Self::connection_failed("Database worker crashed"),
            _ => Self::new(StoreOperation::Select, StoreErrorKind::Other, err.to_string()),
        }
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Store(StoreError::from(err))
    }
}
