//! # acton-dal
//!
//! Generic transactional data access layer.
//!
//! One repository type gives every entity the same CRUD, soft-delete,
//! pagination and raw-query semantics over a pluggable store, and a
//! coordinator runs units of work inside a transaction with exactly one
//! commit or rollback followed by exactly one release.
//!
//! ## Features
//!
//! - **Generic repository**: create, batch create, find, paginate, update, delete
//! - **Soft delete**: configurable marker column, merged into every default read
//! - **Transactions**: every operation can run on the default connection or a caller-owned session
//! - **Stores**: in-memory snapshot store, PostgreSQL via sqlx (`database` feature)
//! - **Configuration**: layered TOML + environment via figment
//! - **Observability**: structured JSON logging via tracing
//!
//! ## Example
//!
//! ```rust,no_run
//! use acton_dal::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct User {
//!     id: String,
//!     email: String,
//!     #[serde(default)]
//!     is_deleted: bool,
//! }
//!
//! #[derive(Serialize)]
//! struct NewUser {
//!     email: String,
//! }
//!
//! #[derive(Default, Serialize)]
//! struct UserPatch {
//!     #[serde(skip_serializing_if = "Option::is_none")]
//!     email: Option<String>,
//! }
//!
//! impl Entity for User {
//!     const TABLE: &'static str = "users";
//!     type Id = String;
//!     type Create = NewUser;
//!     type Update = UserPatch;
//!
//!     fn id(&self) -> &String {
//!         &self.id
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let users = GenericRepository::<User, _>::from_config(MemoryStore::new(), &config.repository);
//!     let user = users.create(NewUser { email: "ada@example.com".into() }, None).await?;
//!     users.soft_delete(&user.id, Some("admin"), None).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod repository;
pub mod store;

#[cfg(feature = "database")]
pub mod database;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Config, DatabaseConfig, RepositoryConfig};
    pub use crate::error::{Error, Result, StoreError, StoreErrorKind, StoreOperation};
    pub use crate::observability::init_tracing;
    pub use crate::repository::{
        run_in_transaction, Entity, FilterCondition, FilterOperator, FilterValue, FindOptions,
        GenericRepository, OrderDirection, Page, PageRequest, Pagination, RepositoryError,
        RepositoryErrorKind, RepositoryOperation, RepositoryResult, SessionState,
        SoftDeletePolicy, TransactionSession, WriteHook,
    };
    pub use crate::store::{EntityStore, Handle, MemorySession, MemoryStore, Record, TableSchema};

    #[cfg(feature = "database")]
    pub use crate::database::create_pool;
    #[cfg(feature = "database")]
    pub use crate::store::{PgSession, PgStore};
}

#[cfg(test)]
pub(crate) mod testing {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    use crate::repository::Entity;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Widget {
        pub id: String,
        pub name: String,
        #[serde(default)]
        pub is_deleted: bool,
        pub deleted_at: Option<DateTime<Utc>>,
        pub deleted_by: Option<String>,
    }

    #[derive(Debug, Serialize)]
    pub struct NewWidget {
        pub name: String,
    }

    impl NewWidget {
        pub fn named(name: &str) -> Self {
            Self {
                name: name.to_string(),
            }
        }
    }

    #[derive(Debug, Default, Serialize)]
    pub struct WidgetPatch {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub name: Option<String>,
    }

    impl WidgetPatch {
        pub fn name(name: &str) -> Self {
            Self {
                name: Some(name.to_string()),
            }
        }
    }

    impl Entity for Widget {
        const TABLE: &'static str = "widgets";
        type Id = String;
        type Create = NewWidget;
        type Update = WidgetPatch;

        fn id(&self) -> &String {
            &self.id
        }
    }
}
