//! Generic repository over a pluggable entity store
//!
//! This module provides one repository type that gives every entity uniform
//! CRUD, soft-delete, pagination, raw-query and transaction semantics, whether
//! or not a transaction is in flight.
//!
//! # Features
//!
//! - **Generic CRUD**: [`GenericRepository`] over any [`Entity`] and [`EntityStore`](crate::store::EntityStore)
//! - **Soft Delete**: [`SoftDeletePolicy`] decides the marker column and the default read filter
//! - **Filtering**: [`FilterCondition`] and [`FindOptions`] for predicates, ordering and relations
//! - **Pagination**: [`PageRequest`] in, [`Page`] out, with the total over the full filtered set
//! - **Transactions**: [`run_in_transaction`] commits or rolls back, then always releases
//! - **Write hooks**: [`WriteHook`] rewrites records before they are written
//!
//! # Example
//!
//! ```rust
//! use acton_dal::repository::{
//!     run_in_transaction, Entity, FilterCondition, FindOptions, GenericRepository, PageRequest,
//!     RepositoryError,
//! };
//! use acton_dal::store::MemoryStore;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Order {
//!     id: String,
//!     customer: String,
//!     #[serde(default)]
//!     is_deleted: bool,
//! }
//!
//! #[derive(Serialize)]
//! struct NewOrder {
//!     customer: String,
//! }
//!
//! #[derive(Serialize)]
//! struct OrderPatch {}
//!
//! impl Entity for Order {
//!     const TABLE: &'static str = "orders";
//!     type Id = String;
//!     type Create = NewOrder;
//!     type Update = OrderPatch;
//!
//!     fn id(&self) -> &String {
//!         &self.id
//!     }
//! }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let orders = &GenericRepository::<Order, _>::new(MemoryStore::new());
//!
//! run_in_transaction(orders.session(), |tx| async move {
//!     orders.create(NewOrder { customer: "ada".into() }, Some(&tx)).await?;
//!     orders.create(NewOrder { customer: "grace".into() }, Some(&tx)).await?;
//!     Ok::<_, RepositoryError>(())
//! })
//! .await
//! .unwrap();
//!
//! let options = FindOptions::new().filter(FilterCondition::eq("customer", "ada"));
//! let page = orders.find_paginated(&options, PageRequest::default(), None).await.unwrap();
//! assert_eq!(page.total, 1);
//! # });
//! ```

mod entity;
mod error;
mod generic;
mod hooks;
mod pagination;
mod policy;
mod transaction;

// Re-export all public types
pub use entity::Entity;
pub use error::{RepositoryError, RepositoryErrorKind, RepositoryOperation};
pub use generic::GenericRepository;
pub use hooks::{LowercaseStrings, WriteHook};
pub use pagination::{
    FilterCondition, FilterOperator, FilterValue, FindOptions, OrderDirection, Page, PageRequest,
    Pagination,
};
pub use policy::SoftDeletePolicy;
pub use transaction::{
    run_in_transaction, SessionState, SessionStateCell, TransactionSession, RELEASABLE,
};

/// Result type for repository operations
pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;
