//! Repository error types
//!
//! Every repository method wraps adapter failures exactly once, tagging them
//! with the [`RepositoryOperation`] that failed. Absence is never an error:
//! lookups return `Ok(None)` instead.
//!
//! # Example
//!
//! ```rust
//! use acton_dal::repository::{RepositoryError, RepositoryErrorKind, RepositoryOperation};
//!
//! let error = RepositoryError::validation_failed(RepositoryOperation::FindPaginated, "page must be >= 1");
//! assert!(matches!(error.kind, RepositoryErrorKind::ValidationFailed));
//! assert!(error.is_validation());
//! ```

use std::fmt;

use crate::error::{StoreError, StoreErrorKind};

/// Operation being performed when the repository error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositoryOperation {
    /// Creating a single entity
    Create,
    /// Creating a batch of entities
    CreateMany,
    /// Finding all entities visible under the default filter
    FindAll,
    /// Finding the first matching entity
    FindOne,
    /// Finding a single entity by ID
    FindById,
    /// Finding a single entity by an arbitrary field
    FindByField,
    /// Finding one page of entities plus the total count
    FindPaginated,
    /// Finding entities regardless of the soft-delete marker
    FindWithDeleted,
    /// Finding only soft-deleted entities
    FindDeleted,
    /// Counting entities matching filters
    Count,
    /// Checking if an entity exists
    Exists,
    /// Updating an existing entity
    Update,
    /// Deleting an entity (hard delete)
    Delete,
    /// Soft deleting an entity
    SoftDelete,
    /// Restoring a soft-deleted entity
    Restore,
    /// Raw statement passthrough
    Query,
    /// Transaction start, commit, rollback or release
    Transaction,
}

impl fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::CreateMany => write!(f, "create_many"),
            Self::FindAll => write!(f, "find_all"),
            Self::FindOne => write!(f, "find_one"),
            Self::FindById => write!(f, "find_by_id"),
            Self::FindByField => write!(f, "find_by_field"),
            Self::FindPaginated => write!(f, "find_paginated"),
            Self::FindWithDeleted => write!(f, "find_with_deleted"),
            Self::FindDeleted => write!(f, "find_deleted"),
            Self::Count => write!(f, "count"),
            Self::Exists => write!(f, "exists"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::SoftDelete => write!(f, "soft_delete"),
            Self::Restore => write!(f, "restore"),
            Self::Query => write!(f, "query"),
            Self::Transaction => write!(f, "transaction"),
        }
    }
}

/// Category of repository error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositoryErrorKind {
    /// Database constraint violation
    ConstraintViolation,
    /// Caller input rejected before reaching the store
    ValidationFailed,
    /// Failed to connect to database
    ConnectionFailed,
    /// Operation timed out
    Timeout,
    /// Underlying database error
    DatabaseError,
    /// Serialization or deserialization error
    SerializationError,
    /// Transaction start, commit, rollback or release failed
    TransactionFailed,
    /// Other unclassified error
    Other,
}

impl fmt::Display for RepositoryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConstraintViolation => write!(f, "constraint_violation"),
            Self::ValidationFailed => write!(f, "validation_failed"),
            Self::ConnectionFailed => write!(f, "connection_failed"),
            Self::Timeout => write!(f, "timeout"),
            Self::DatabaseError => write!(f, "database_error"),
            Self::SerializationError => write!(f, "serialization_error"),
            Self::TransactionFailed => write!(f, "transaction_failed"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Structured repository error with operation context
///
/// # Example
///
/// ```rust
/// use acton_dal::repository::{RepositoryError, RepositoryOperation};
///
/// let error = RepositoryError::database_error(RepositoryOperation::Create, "relation does not exist")
///     .with_entity("widgets", "w_1");
/// assert_eq!(
///     error.to_string(),
///     "Repository database_error error during create: relation does not exist [widgets: w_1]"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryError {
    /// The operation being performed when the error occurred
    pub operation: RepositoryOperation,
    /// The category of error
    pub kind: RepositoryErrorKind,
    /// Human-readable error message, carrying the underlying store message
    pub message: String,
    /// The type of entity involved (the entity's table name)
    pub entity_type: Option<String>,
    /// The ID of the entity involved
    pub entity_id: Option<String>,
}

impl RepositoryError {
    /// Create a new repository error
    pub fn new(
        operation: RepositoryOperation,
        kind: RepositoryErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
            entity_type: None,
            entity_id: None,
        }
    }

    /// Wrap an adapter failure, tagging it with the failing operation
    pub fn from_store(operation: RepositoryOperation, err: StoreError) -> Self {
        let kind = match err.kind {
            StoreErrorKind::ConstraintViolation => RepositoryErrorKind::ConstraintViolation,
            StoreErrorKind::ConnectionFailed | StoreErrorKind::PoolExhausted => {
                RepositoryErrorKind::ConnectionFailed
            }
            StoreErrorKind::Timeout => RepositoryErrorKind::Timeout,
            StoreErrorKind::TypeConversion => RepositoryErrorKind::SerializationError,
            StoreErrorKind::TransactionFailed => RepositoryErrorKind::TransactionFailed,
            StoreErrorKind::InvalidInput => RepositoryErrorKind::ValidationFailed,
            StoreErrorKind::QueryFailed
            | StoreErrorKind::Configuration
            | StoreErrorKind::Unsupported => RepositoryErrorKind::DatabaseError,
            StoreErrorKind::Other => RepositoryErrorKind::Other,
        };

        let message = match err.context {
            Some(ctx) => format!("{} ({})", err.message, ctx),
            None => err.message,
        };

        Self::new(operation, kind, message)
    }

    /// Create a validation failed error
    pub fn validation_failed(operation: RepositoryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, RepositoryErrorKind::ValidationFailed, message)
    }

    /// Create a database error
    pub fn database_error(operation: RepositoryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, RepositoryErrorKind::DatabaseError, message)
    }

    /// Create a serialization error
    pub fn serialization_error(operation: RepositoryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, RepositoryErrorKind::SerializationError, message)
    }

    /// Create a transaction failed error
    pub fn transaction_failed(message: impl Into<String>) -> Self {
        Self::new(
            RepositoryOperation::Transaction,
            RepositoryErrorKind::TransactionFailed,
            message,
        )
    }

    /// Add entity context to an existing error
    #[must_use]
    pub fn with_entity(
        mut self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Add only the entity type to an existing error
    #[must_use]
    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    /// Set the operation that caused the error
    #[must_use]
    pub fn with_operation(mut self, operation: RepositoryOperation) -> Self {
        self.operation = operation;
        self
    }

    /// Failure raised by the persistence engine (constraint, connectivity, timeout, ...)
    pub fn is_persistence(&self) -> bool {
        matches!(
            self.kind,
            RepositoryErrorKind::ConstraintViolation
                | RepositoryErrorKind::ConnectionFailed
                | RepositoryErrorKind::Timeout
                | RepositoryErrorKind::DatabaseError
                | RepositoryErrorKind::SerializationError
                | RepositoryErrorKind::Other
        )
    }

    /// Failure during transaction start, commit, rollback or release
    pub fn is_transaction(&self) -> bool {
        self.kind == RepositoryErrorKind::TransactionFailed
    }

    /// Caller input was rejected before any store call
    pub fn is_validation(&self) -> bool {
        self.kind == RepositoryErrorKind::ValidationFailed
    }

    /// Check if this error is retriable (transient errors that may succeed on retry)
    ///
    /// The repository itself never retries; this is a hint for callers.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind,
            RepositoryErrorKind::ConnectionFailed | RepositoryErrorKind::Timeout
        )
    }
}

impl fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Repository {} error during {}: {}",
            self.kind, self.operation, self.message
        )?;
        match (&self.entity_type, &self.entity_id) {
            (Some(entity_type), Some(entity_id)) => write!(f, " [{}: {}]", entity_type, entity_id)?,
            (Some(entity_type), None) => write!(f, " [{}]", entity_type)?,
            _ => {}
        }
        Ok(())
    }
}

impl std::error::Error for RepositoryError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreOperation;

    #[test]
    fn test_repository_operation_display() {
        assert_eq!(format!("{}", RepositoryOperation::Create), "create");
        assert_eq!(format!("{}", RepositoryOperation::CreateMany), "create_many");
        assert_eq!(format!("{}", RepositoryOperation::FindAll), "find_all");
        assert_eq!(format!("{}", RepositoryOperation::FindOne), "find_one");
        assert_eq!(format!("{}", RepositoryOperation::FindById), "find_by_id");
        assert_eq!(format!("{}", RepositoryOperation::FindByField), "find_by_field");
        assert_eq!(
            format!("{}", RepositoryOperation::FindWithDeleted),
            "find_with_deleted"
        );
        assert_eq!(format!("{}", RepositoryOperation::FindDeleted), "find_deleted");
        assert_eq!(
            format!("{}", RepositoryOperation::FindPaginated),
            "find_paginated"
        );
        assert_eq!(format!("{}", RepositoryOperation::SoftDelete), "soft_delete");
        assert_eq!(format!("{}", RepositoryOperation::Restore), "restore");
        assert_eq!(format!("{}", RepositoryOperation::Query), "query");
        assert_eq!(format!("{}", RepositoryOperation::Transaction), "transaction");
    }

    #[test]
    fn test_from_store_maps_kind_and_keeps_message() {
        let store = StoreError::constraint_violation(
            StoreOperation::Insert,
            "duplicate key value violates unique constraint",
        );
        let error = RepositoryError::from_store(RepositoryOperation::Create, store);
        assert_eq!(error.operation, RepositoryOperation::Create);
        assert_eq!(error.kind, RepositoryErrorKind::ConstraintViolation);
        assert!(error.message.contains("duplicate key"));
        assert!(error.is_persistence());
    }

    #[test]
    fn test_from_store_appends_context() {
        let store = StoreError::query_failed(StoreOperation::Select, "syntax error")
            .add_context("widgets");
        let error = RepositoryError::from_store(RepositoryOperation::FindAll, store);
        assert_eq!(error.message, "syntax error (widgets)");
    }

    #[test]
    fn test_from_store_transaction_and_input_kinds() {
        let tx = RepositoryError::from_store(
            RepositoryOperation::Transaction,
            StoreError::transaction_failed("commit refused"),
        );
        assert!(tx.is_transaction());
        assert!(!tx.is_persistence());

        let input = RepositoryError::from_store(
            RepositoryOperation::FindAll,
            StoreError::invalid_input(StoreOperation::Select, "bad identifier"),
        );
        assert!(input.is_validation());
    }

    #[test]
    fn test_is_retriable() {
        let conn = RepositoryError::from_store(
            RepositoryOperation::FindAll,
            StoreError::connection_failed("refused"),
        );
        assert!(conn.is_retriable());
        assert!(!RepositoryError::validation_failed(RepositoryOperation::FindPaginated, "page")
            .is_retriable());
        assert!(!RepositoryError::transaction_failed("rollback").is_retriable());
    }

    #[test]
    fn test_display_without_entity() {
        let error = RepositoryError::database_error(RepositoryOperation::Delete, "Query failed");
        let display = error.to_string();
        assert!(display.contains("database_error"));
        assert!(display.contains("delete"));
        assert!(!display.contains('['));
    }

    #[test]
    fn test_display_with_entity_type_only() {
        let error = RepositoryError::database_error(RepositoryOperation::FindAll, "boom")
            .with_entity_type("widgets");
        assert!(error.to_string().ends_with("[widgets]"));
    }

    #[test]
    fn test_with_entity() {
        let error = RepositoryError::database_error(RepositoryOperation::Update, "boom")
            .with_entity("users", "usr_123");
        assert_eq!(error.entity_type.as_deref(), Some("users"));
        assert_eq!(error.entity_id.as_deref(), Some("usr_123"));
    }

    #[test]
    fn test_with_operation() {
        let error = RepositoryError::transaction_failed("release failed")
            .with_operation(RepositoryOperation::Create);
        assert_eq!(error.operation, RepositoryOperation::Create);
    }

    #[test]
    fn test_error_is_error_trait() {
        let error: Box<dyn std::error::Error> = Box::new(RepositoryError::database_error(
            RepositoryOperation::Query,
            "boom",
        ));
        assert!(error.to_string().contains("query"));
    }
}
