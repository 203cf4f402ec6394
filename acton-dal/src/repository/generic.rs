//! The generic repository
//!
//! [`GenericRepository`] gives one [`Entity`] type uniform CRUD, soft-delete,
//! pagination, raw-query and transaction semantics over any [`EntityStore`].
//! Every operation takes an optional session: `None` runs against the store's
//! default connection, `Some(&session)` routes the call through an open
//! transaction owned by the caller. The choice is resolved once per call into
//! a [`Handle`].
//!
//! Reads through [`find_all`](GenericRepository::find_all),
//! [`find_one`](GenericRepository::find_one),
//! [`find_paginated`](GenericRepository::find_paginated) and
//! [`count`](GenericRepository::count) get the policy's "not deleted"
//! predicate merged into a copy of the caller's options, unless the caller
//! already filters on the marker column. Lookups by identity
//! ([`find_by_id`](GenericRepository::find_by_id),
//! [`find_by_field`](GenericRepository::find_by_field),
//! [`exists`](GenericRepository::exists)) intentionally skip that predicate so
//! soft-deleted rows stay reachable by key.
//!
//! # Example
//!
//! ```rust
//! use acton_dal::repository::{Entity, FindOptions, GenericRepository};
//! use acton_dal::store::MemoryStore;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Note {
//!     id: String,
//!     body: String,
//!     #[serde(default)]
//!     is_deleted: bool,
//! }
//!
//! #[derive(Serialize)]
//! struct NewNote {
//!     body: String,
//! }
//!
//! #[derive(Default, Serialize)]
//! struct NotePatch {
//!     #[serde(skip_serializing_if = "Option::is_none")]
//!     body: Option<String>,
//! }
//!
//! impl Entity for Note {
//!     const TABLE: &'static str = "notes";
//!     type Id = String;
//!     type Create = NewNote;
//!     type Update = NotePatch;
//!
//!     fn id(&self) -> &String {
//!         &self.id
//!     }
//! }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let notes = GenericRepository::<Note, _>::new(MemoryStore::new());
//!
//! let note = notes.create(NewNote { body: "hello".into() }, None).await.unwrap();
//! assert!(notes.soft_delete(&note.id, Some("usr_1"), None).await.unwrap());
//!
//! // hidden from default reads, still reachable by id
//! assert!(notes.find_all(&FindOptions::new(), None).await.unwrap().is_empty());
//! assert!(notes.find_by_id(&note.id, None).await.unwrap().unwrap().is_deleted);
//! # });
//! ```

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::entity::{from_record, id_value, to_record, Entity};
use super::error::{RepositoryError, RepositoryOperation};
use super::hooks::WriteHook;
use super::pagination::{FilterCondition, FilterValue, FindOptions, Page, PageRequest, Pagination};
use super::policy::SoftDeletePolicy;
use super::transaction::run_in_transaction;
use super::RepositoryResult;
use crate::config::RepositoryConfig;
use crate::error::StoreError;
use crate::store::{EntityStore, Handle, Record};

/// Uniform typed access to one entity's storage
pub struct GenericRepository<T, St> {
    store: St,
    policy: SoftDeletePolicy,
    hooks: Vec<Arc<dyn WriteHook>>,
    default_page_size: u64,
    max_page_size: u64,
    _entity: PhantomData<fn() -> T>,
}

impl<T, St: Clone> Clone for GenericRepository<T, St> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            policy: self.policy.clone(),
            hooks: self.hooks.clone(),
            default_page_size: self.default_page_size,
            max_page_size: self.max_page_size,
            _entity: PhantomData,
        }
    }
}

impl<T: Entity, St: fmt::Debug> fmt::Debug for GenericRepository<T, St> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericRepository")
            .field("entity", &T::TABLE)
            .field("store", &self.store)
            .field("policy", &self.policy)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl<T: Entity, St: EntityStore> GenericRepository<T, St> {
    /// A repository with the default `is_deleted` flag policy and page sizes
    pub fn new(store: St) -> Self {
        Self::from_config(store, &RepositoryConfig::default())
    }

    /// A repository using the page sizes and soft-delete policy from configuration
    pub fn from_config(store: St, config: &RepositoryConfig) -> Self {
        Self {
            store,
            policy: config.soft_delete.clone(),
            hooks: Vec::new(),
            default_page_size: config.default_page_size,
            max_page_size: config.max_page_size,
            _entity: PhantomData,
        }
    }

    /// Replace the soft-delete policy
    #[must_use]
    pub fn soft_delete_policy(mut self, policy: SoftDeletePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Register a hook run on every inserted record and update change set
    #[must_use]
    pub fn hook(mut self, hook: impl WriteHook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    /// Largest page size [`find_paginated`](Self::find_paginated) accepts
    #[must_use]
    pub fn max_page_size(mut self, max: u64) -> Self {
        self.max_page_size = max;
        self
    }

    /// A repository over the same store and hooks targeting a different marker
    pub fn with_policy(&self, policy: SoftDeletePolicy) -> Self
    where
        St: Clone,
    {
        let mut repo = self.clone();
        repo.policy = policy;
        repo
    }

    /// The soft-delete policy in effect
    pub fn policy(&self) -> &SoftDeletePolicy {
        &self.policy
    }

    /// The underlying store
    pub fn store(&self) -> &St {
        &self.store
    }

    /// A fresh, not-yet-started transaction session from the store
    pub fn session(&self) -> St::Session {
        self.store.session()
    }

    /// Fill in the configured defaults for an optional page and limit
    pub fn page_request(&self, page: Option<u64>, limit: Option<u64>) -> PageRequest {
        PageRequest::new(page.unwrap_or(1), limit.unwrap_or(self.default_page_size))
    }

    fn resolve(session: Option<&St::Session>) -> Handle<'_, St::Session> {
        Handle::resolve(session)
    }

    fn wrap(operation: RepositoryOperation, err: StoreError) -> RepositoryError {
        let err = RepositoryError::from_store(operation, err).with_entity_type(T::TABLE);
        warn!(entity = T::TABLE, %operation, error = %err, "repository operation failed");
        err
    }

    fn wrap_id(operation: RepositoryOperation, id: &T::Id, err: StoreError) -> RepositoryError {
        let err = RepositoryError::from_store(operation, err).with_entity(T::TABLE, id.to_string());
        warn!(entity = T::TABLE, %operation, error = %err, "repository operation failed");
        err
    }

    fn id_filter(operation: RepositoryOperation, id: &T::Id) -> RepositoryResult<FilterCondition> {
        let value = id_value(operation, id)?;
        Ok(FilterCondition::eq(T::ID_FIELD, FilterValue::from(value)))
    }

    fn prepare_insert(&self, operation: RepositoryOperation, data: &T::Create) -> RepositoryResult<Record> {
        let mut record = to_record(operation, data).map_err(|e| e.with_entity_type(T::TABLE))?;
        self.policy.stamp_insert(&mut record);
        for hook in &self.hooks {
            hook.before_insert(T::TABLE, &mut record);
        }
        Ok(record)
    }

    fn decode_all(operation: RepositoryOperation, rows: Vec<Record>) -> RepositoryResult<Vec<T>> {
        rows.into_iter()
            .map(|row| from_record(operation, row).map_err(|e| e.with_entity_type(T::TABLE)))
            .collect()
    }

    async fn select(
        &self,
        operation: RepositoryOperation,
        options: &FindOptions,
        session: Option<&St::Session>,
    ) -> RepositoryResult<Vec<T>> {
        let rows = self
            .store
            .find(Self::resolve(session), T::TABLE, options)
            .await
            .map_err(|e| Self::wrap(operation, e))?;
        Self::decode_all(operation, rows)
    }

    async fn select_first(
        &self,
        operation: RepositoryOperation,
        mut options: FindOptions,
        session: Option<&St::Session>,
    ) -> RepositoryResult<Option<T>> {
        let offset = options.pagination.map_or(0, |p| p.offset);
        options.pagination = Some(Pagination::new(offset, 1));
        Ok(self.select(operation, &options, session).await?.into_iter().next())
    }

    /// Persist a new entity and return it with generated fields filled in
    pub async fn create(&self, data: T::Create, session: Option<&St::Session>) -> RepositoryResult<T> {
        let op = RepositoryOperation::Create;
        debug!(entity = T::TABLE, session = session.is_some(), "create");

        let record = self.prepare_insert(op, &data)?;
        let mut rows = self
            .store
            .insert(Self::resolve(session), T::TABLE, vec![record])
            .await
            .map_err(|e| Self::wrap(op, e))?;

        let row = rows.pop().ok_or_else(|| {
            RepositoryError::database_error(op, "store returned no row").with_entity_type(T::TABLE)
        })?;
        from_record(op, row).map_err(|e| e.with_entity_type(T::TABLE))
    }

    /// Persist a batch; the result lines up 1:1 and in order with the input
    ///
    /// The batch is all-or-nothing. An empty batch never reaches the store.
    pub async fn create_many(
        &self,
        data: Vec<T::Create>,
        session: Option<&St::Session>,
    ) -> RepositoryResult<Vec<T>> {
        let op = RepositoryOperation::CreateMany;
        debug!(entity = T::TABLE, rows = data.len(), session = session.is_some(), "create_many");
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let records = data
            .iter()
            .map(|item| self.prepare_insert(op, item))
            .collect::<RepositoryResult<Vec<_>>>()?;
        let expected = records.len();

        let rows = self
            .store
            .insert(Self::resolve(session), T::TABLE, records)
            .await
            .map_err(|e| Self::wrap(op, e))?;

        if rows.len() != expected {
            return Err(RepositoryError::database_error(
                op,
                format!("store returned {} rows for {} inputs", rows.len(), expected),
            )
            .with_entity_type(T::TABLE));
        }
        Self::decode_all(op, rows)
    }

    /// Every entity matching `options` that is not soft-deleted
    pub async fn find_all(
        &self,
        options: &FindOptions,
        session: Option<&St::Session>,
    ) -> RepositoryResult<Vec<T>> {
        debug!(entity = T::TABLE, filters = options.filters.len(), "find_all");
        let merged = self.policy.apply_default(options);
        self.select(RepositoryOperation::FindAll, &merged, session).await
    }

    /// The first entity matching `options` that is not soft-deleted
    pub async fn find_one(
        &self,
        options: &FindOptions,
        session: Option<&St::Session>,
    ) -> RepositoryResult<Option<T>> {
        debug!(entity = T::TABLE, filters = options.filters.len(), "find_one");
        let merged = self.policy.apply_default(options);
        self.select_first(RepositoryOperation::FindOne, merged, session).await
    }

    /// The entity with identity `id`, soft-deleted or not
    pub async fn find_by_id(&self, id: &T::Id, session: Option<&St::Session>) -> RepositoryResult<Option<T>> {
        let op = RepositoryOperation::FindById;
        debug!(entity = T::TABLE, %id, "find_by_id");
        let options = FindOptions::new().filter(Self::id_filter(op, id)?);
        self.select_first(op, options, session)
            .await
            .map_err(|e| e.with_entity(T::TABLE, id.to_string()))
    }

    /// The first entity whose `field` equals `value`, soft-deleted or not
    pub async fn find_by_field(
        &self,
        field: &str,
        value: impl Into<FilterValue>,
        session: Option<&St::Session>,
    ) -> RepositoryResult<Option<T>> {
        debug!(entity = T::TABLE, field, "find_by_field");
        let options = FindOptions::new().filter(FilterCondition::eq(field, value));
        self.select_first(RepositoryOperation::FindByField, options, session).await
    }

    /// One page of visible entities plus the count over the whole filtered set
    ///
    /// `request` is validated before the store is touched.
    pub async fn find_paginated(
        &self,
        options: &FindOptions,
        request: PageRequest,
        session: Option<&St::Session>,
    ) -> RepositoryResult<Page<T>> {
        let op = RepositoryOperation::FindPaginated;
        debug!(entity = T::TABLE, page = request.page, limit = request.limit, "find_paginated");
        request
            .validate(self.max_page_size)
            .map_err(|e| e.with_entity_type(T::TABLE))?;

        let merged = self.policy.apply_default(options);
        let total = self
            .store
            .count(Self::resolve(session), T::TABLE, &merged.filters)
            .await
            .map_err(|e| Self::wrap(op, e))?;

        let sliced = merged.paginate(request.to_pagination());
        let data = self.select(op, &sliced, session).await?;

        Ok(Page {
            data,
            total,
            page: request.page,
            limit: request.limit,
        })
    }

    /// Number of visible entities matching `filters`
    pub async fn count(
        &self,
        filters: &[FilterCondition],
        session: Option<&St::Session>,
    ) -> RepositoryResult<u64> {
        let op = RepositoryOperation::Count;
        let merged = self
            .policy
            .apply_default(&FindOptions::with_filters(filters.iter().cloned()));
        self.store
            .count(Self::resolve(session), T::TABLE, &merged.filters)
            .await
            .map_err(|e| Self::wrap(op, e))
    }

    /// Whether a row with identity `id` exists, soft-deleted or not
    pub async fn exists(&self, id: &T::Id, session: Option<&St::Session>) -> RepositoryResult<bool> {
        let op = RepositoryOperation::Exists;
        let filter = Self::id_filter(op, id)?;
        let total = self
            .store
            .count(Self::resolve(session), T::TABLE, &[filter])
            .await
            .map_err(|e| Self::wrap_id(op, id, e))?;
        Ok(total > 0)
    }

    /// Every entity matching `options`, including soft-deleted ones
    pub async fn find_with_deleted(
        &self,
        options: &FindOptions,
        session: Option<&St::Session>,
    ) -> RepositoryResult<Vec<T>> {
        debug!(entity = T::TABLE, "find_with_deleted");
        self.select(RepositoryOperation::FindWithDeleted, options, session).await
    }

    /// Only soft-deleted entities matching `options`
    pub async fn find_deleted(
        &self,
        options: &FindOptions,
        session: Option<&St::Session>,
    ) -> RepositoryResult<Vec<T>> {
        let op = RepositoryOperation::FindDeleted;
        if !self.policy.is_enabled() {
            return Err(
                RepositoryError::validation_failed(op, "soft delete is disabled").with_entity_type(T::TABLE),
            );
        }
        debug!(entity = T::TABLE, "find_deleted");
        let merged = self.policy.apply_deleted(options);
        self.select(op, &merged, session).await
    }

    /// Apply a partial update; `None` when no row has identity `id`
    ///
    /// An update that serializes to no fields writes nothing and returns the
    /// current row.
    pub async fn update(
        &self,
        id: &T::Id,
        data: T::Update,
        session: Option<&St::Session>,
    ) -> RepositoryResult<Option<T>> {
        let op = RepositoryOperation::Update;
        debug!(entity = T::TABLE, %id, session = session.is_some(), "update");

        let mut changes = to_record(op, &data).map_err(|e| e.with_entity(T::TABLE, id.to_string()))?;
        if changes.is_empty() {
            return self
                .find_by_id(id, session)
                .await
                .map_err(|e| e.with_operation(op));
        }
        for hook in &self.hooks {
            hook.before_update(T::TABLE, &mut changes);
        }

        let filter = Self::id_filter(op, id)?;
        let changed = self
            .store
            .update(Self::resolve(session), T::TABLE, &[filter], changes)
            .await
            .map_err(|e| Self::wrap_id(op, id, e))?;
        if changed == 0 {
            return Ok(None);
        }

        self.find_by_id(id, session)
            .await
            .map_err(|e| e.with_operation(op))
    }

    /// Remove the row for good; `true` when a row was removed
    pub async fn delete(&self, id: &T::Id, session: Option<&St::Session>) -> RepositoryResult<bool> {
        let op = RepositoryOperation::Delete;
        debug!(entity = T::TABLE, %id, session = session.is_some(), "delete");
        let filter = Self::id_filter(op, id)?;
        let removed = self
            .store
            .delete(Self::resolve(session), T::TABLE, &[filter])
            .await
            .map_err(|e| Self::wrap_id(op, id, e))?;
        Ok(removed > 0)
    }

    /// Mark the row deleted and stamp the audit columns
    ///
    /// Only a visible row is touched, so a second call returns `false` and
    /// leaves the first call's audit stamps in place.
    pub async fn soft_delete(
        &self,
        id: &T::Id,
        deleted_by: Option<&str>,
        session: Option<&St::Session>,
    ) -> RepositoryResult<bool> {
        let op = RepositoryOperation::SoftDelete;
        debug!(entity = T::TABLE, %id, deleted_by, "soft_delete");

        let (Some(changes), Some(visible)) = (
            self.policy.deleted_changes(deleted_by, Utc::now()),
            self.policy.visible_filter(),
        ) else {
            return Err(RepositoryError::validation_failed(op, "soft delete is disabled")
                .with_entity(T::TABLE, id.to_string()));
        };

        let filters = [Self::id_filter(op, id)?, visible];
        let changed = self
            .store
            .update(Self::resolve(session), T::TABLE, &filters, changes)
            .await
            .map_err(|e| Self::wrap_id(op, id, e))?;
        Ok(changed > 0)
    }

    /// Make a soft-deleted row visible again; `true` when this call restored it
    pub async fn restore(&self, id: &T::Id, session: Option<&St::Session>) -> RepositoryResult<bool> {
        let op = RepositoryOperation::Restore;
        debug!(entity = T::TABLE, %id, "restore");

        let (Some(changes), Some(deleted)) =
            (self.policy.restored_changes(), self.policy.deleted_filter())
        else {
            return Err(RepositoryError::validation_failed(op, "soft delete is disabled")
                .with_entity(T::TABLE, id.to_string()));
        };

        let filters = [Self::id_filter(op, id)?, deleted];
        let changed = self
            .store
            .update(Self::resolve(session), T::TABLE, &filters, changes)
            .await
            .map_err(|e| Self::wrap_id(op, id, e))?;
        Ok(changed > 0)
    }

    /// Pass a statement straight to the store, bypassing every default filter
    ///
    /// What `statement` means is up to the store: SQL for `PgStore`, a
    /// registered statement name for `MemoryStore`. Callers own its safety.
    /// On PostgreSQL, selects and writes ending in `RETURNING` yield their
    /// rows; other writes yield one `{"rows_affected": n}` record.
    pub async fn query(
        &self,
        statement: &str,
        params: Vec<Value>,
        session: Option<&St::Session>,
    ) -> RepositoryResult<Vec<Record>> {
        let op = RepositoryOperation::Query;
        debug!(entity = T::TABLE, params = params.len(), "query");
        self.store
            .raw(Self::resolve(session), statement, params)
            .await
            .map_err(|e| Self::wrap(op, e))
    }

    /// [`query`](Self::query), deserializing each row into `R`
    pub async fn query_as<R: DeserializeOwned>(
        &self,
        statement: &str,
        params: Vec<Value>,
        session: Option<&St::Session>,
    ) -> RepositoryResult<Vec<R>> {
        let op = RepositoryOperation::Query;
        self.query(statement, params, session)
            .await?
            .into_iter()
            .map(|row| from_record(op, row).map_err(|e| e.with_entity_type(T::TABLE)))
            .collect()
    }

    /// Run `work` in `session`: commit on success, roll back on failure, always release
    ///
    /// See [`run_in_transaction`] for the exact ordering.
    pub async fn run_in_transaction<F, Fut, R, E>(&self, session: St::Session, work: F) -> Result<R, E>
    where
        F: FnOnce(St::Session) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<RepositoryError>,
    {
        debug!(entity = T::TABLE, "run_in_transaction");
        run_in_transaction(session, work).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{
        LowercaseStrings, OrderDirection, RepositoryErrorKind, SessionState, TransactionSession,
    };
    use crate::store::{MemoryStore, MemoryTables, TableSchema};
    use crate::testing::{NewWidget, Widget, WidgetPatch};
    use serde_json::json;

    type Widgets = GenericRepository<Widget, MemoryStore>;

    fn widgets() -> Widgets {
        GenericRepository::new(MemoryStore::new())
    }

    async fn seed(repo: &Widgets, names: &[&str]) -> Vec<Widget> {
        let input = names.iter().map(|n| NewWidget::named(n)).collect();
        repo.create_many(input, None).await.unwrap()
    }

    fn names(rows: &[Widget]) -> Vec<&str> {
        rows.iter().map(|w| w.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_lifecycle_scenario() {
        let repo = widgets();

        let created = repo.create(NewWidget::named("a"), None).await.unwrap();
        assert_eq!(names(&repo.find_all(&FindOptions::new(), None).await.unwrap()), ["a"]);

        assert!(repo.soft_delete(&created.id, None, None).await.unwrap());
        assert!(repo.find_all(&FindOptions::new(), None).await.unwrap().is_empty());
        let hidden = repo.find_by_id(&created.id, None).await.unwrap().unwrap();
        assert!(hidden.is_deleted);

        assert!(repo.restore(&created.id, None).await.unwrap());
        let visible = repo.find_all(&FindOptions::new(), None).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert!(!visible[0].is_deleted);
    }

    #[tokio::test]
    async fn test_create_round_trip() {
        let repo = widgets();
        let created = repo.create(NewWidget::named("gear"), None).await.unwrap();
        assert_eq!(created.name, "gear");
        assert!(!created.id.is_empty());
        assert!(!created.is_deleted);

        let found = repo.find_by_id(&created.id, None).await.unwrap();
        assert_eq!(found, Some(created));
    }

    #[tokio::test]
    async fn test_create_many_preserves_order() {
        let repo = widgets();
        let created = seed(&repo, &["c", "a", "b"]).await;
        assert_eq!(names(&created), ["c", "a", "b"]);
        assert!(repo.create_many(Vec::new(), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_many_is_all_or_nothing() {
        let store = MemoryStore::builder()
            .table("widgets", TableSchema::new().unique("name"))
            .build();
        let repo: Widgets = GenericRepository::new(store);

        let err = repo
            .create_many(vec![NewWidget::named("a"), NewWidget::named("a")], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::ConstraintViolation);
        assert_eq!(err.operation, RepositoryOperation::CreateMany);
        assert_eq!(repo.count(&[], None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_constraint_violation_is_wrapped() {
        let store = MemoryStore::builder()
            .table("widgets", TableSchema::new().unique("name"))
            .build();
        let repo: Widgets = GenericRepository::new(store);
        repo.create(NewWidget::named("a"), None).await.unwrap();

        let err = repo.create(NewWidget::named("a"), None).await.unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::ConstraintViolation);
        assert_eq!(err.operation, RepositoryOperation::Create);
        assert_eq!(err.entity_type.as_deref(), Some("widgets"));
        assert!(err.is_persistence());
        assert!(err.message.contains("name"));
    }

    #[tokio::test]
    async fn test_default_filter_hides_soft_deleted() {
        let repo = widgets();
        let rows = seed(&repo, &["a", "b", "c"]).await;
        repo.soft_delete(&rows[1].id, Some("usr_1"), None).await.unwrap();

        let all = repo.find_all(&FindOptions::new(), None).await.unwrap();
        assert_eq!(names(&all), ["a", "c"]);

        let by_name = FindOptions::new().filter(FilterCondition::eq("name", "b"));
        assert!(repo.find_one(&by_name, None).await.unwrap().is_none());
        assert_eq!(repo.count(&[], None).await.unwrap(), 2);

        let found = repo.find_by_id(&rows[1].id, None).await.unwrap().unwrap();
        assert!(found.is_deleted);
        assert_eq!(found.deleted_by.as_deref(), Some("usr_1"));
        assert!(found.deleted_at.is_some());
    }

    #[tokio::test]
    async fn test_caller_filter_on_marker_wins() {
        let repo = widgets();
        let rows = seed(&repo, &["a", "b"]).await;
        repo.soft_delete(&rows[0].id, None, None).await.unwrap();

        let trash = FindOptions::new().filter(FilterCondition::eq("is_deleted", true));
        let found = repo.find_all(&trash, None).await.unwrap();
        assert_eq!(names(&found), ["a"]);

        let deleted = repo.find_deleted(&FindOptions::new(), None).await.unwrap();
        assert_eq!(names(&deleted), ["a"]);

        let everything = repo.find_with_deleted(&FindOptions::new(), None).await.unwrap();
        assert_eq!(everything.len(), 2);
    }

    #[tokio::test]
    async fn test_options_are_not_mutated() {
        let repo = widgets();
        seed(&repo, &["a"]).await;
        let options = FindOptions::new().filter(FilterCondition::eq("name", "a"));
        let before = options.clone();
        repo.find_all(&options, None).await.unwrap();
        repo.find_paginated(&options, PageRequest::default(), None).await.unwrap();
        assert_eq!(options, before);
    }

    #[tokio::test]
    async fn test_find_one_orders_and_skips_deleted() {
        let repo = widgets();
        let rows = seed(&repo, &["b", "a", "c"]).await;
        repo.soft_delete(&rows[1].id, None, None).await.unwrap();

        let options = FindOptions::new().order_by("name", OrderDirection::Ascending);
        let first = repo.find_one(&options, None).await.unwrap().unwrap();
        assert_eq!(first.name, "b");
    }

    #[tokio::test]
    async fn test_find_by_field_ignores_soft_delete() {
        let repo = widgets();
        let rows = seed(&repo, &["a", "b"]).await;
        repo.soft_delete(&rows[0].id, None, None).await.unwrap();

        let found = repo.find_by_field("name", "a", None).await.unwrap().unwrap();
        assert_eq!(found.id, rows[0].id);
        assert!(repo.find_by_field("name", "zzz", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_id_missing_is_none() {
        let repo = widgets();
        assert!(repo.find_by_id(&"nope".to_string(), None).await.unwrap().is_none());
        assert!(!repo.exists(&"nope".to_string(), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_paginated_total_is_independent_of_slice() {
        let repo = widgets();
        let all: Vec<String> = (0..25).map(|i| format!("w{:02}", i)).collect();
        let refs: Vec<&str> = all.iter().map(String::as_str).collect();
        let rows = seed(&repo, &refs).await;
        repo.soft_delete(&rows[0].id, None, None).await.unwrap();

        let options = FindOptions::new().order_by("name", OrderDirection::Ascending);
        for page in 1..=4 {
            let result = repo
                .find_paginated(&options, PageRequest::new(page, 10), None)
                .await
                .unwrap();
            assert_eq!(result.total, 24);
            assert!(result.data.len() <= 10);
            assert_eq!(result.page, page);
        }

        let last = repo
            .find_paginated(&options, PageRequest::new(3, 10), None)
            .await
            .unwrap();
        assert_eq!(last.data.len(), 4);
        assert_eq!(last.data[0].name, "w21");
        assert_eq!(last.total_pages(), 3);
        assert!(!last.has_next());

        let filtered = FindOptions::new().filter(FilterCondition::like("name", "w1%"));
        let page = repo
            .find_paginated(&filtered, PageRequest::new(1, 3), None)
            .await
            .unwrap();
        assert_eq!(page.total, 10);
        assert_eq!(page.data.len(), 3);
    }

    #[tokio::test]
    async fn test_paginated_rejects_bad_requests() {
        let repo = widgets().max_page_size(50);
        for request in [PageRequest::new(0, 10), PageRequest::new(1, 0), PageRequest::new(1, 51)] {
            let err = repo
                .find_paginated(&FindOptions::new(), request, None)
                .await
                .unwrap_err();
            assert!(err.is_validation());
            assert_eq!(err.operation, RepositoryOperation::FindPaginated);
        }
    }

    #[tokio::test]
    async fn test_page_request_defaults() {
        let config = RepositoryConfig {
            default_page_size: 25,
            ..RepositoryConfig::default()
        };
        let repo: Widgets = GenericRepository::from_config(MemoryStore::new(), &config);
        assert_eq!(repo.page_request(None, None), PageRequest::new(1, 25));
        assert_eq!(repo.page_request(Some(3), Some(5)), PageRequest::new(3, 5));
    }

    #[tokio::test]
    async fn test_update() {
        let repo = widgets();
        let w = repo.create(NewWidget::named("a"), None).await.unwrap();

        let updated = repo
            .update(&w.id, WidgetPatch::name("b"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.name, "b");
        assert_eq!(updated.id, w.id);

        let unchanged = repo
            .update(&w.id, WidgetPatch::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unchanged.name, "b");

        let missing = repo
            .update(&"nope".to_string(), WidgetPatch::name("x"), None)
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_row() {
        let repo = widgets();
        let w = repo.create(NewWidget::named("a"), None).await.unwrap();
        assert!(repo.delete(&w.id, None).await.unwrap());
        assert!(repo.find_by_id(&w.id, None).await.unwrap().is_none());
        assert!(!repo.delete(&w.id, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_soft_delete_is_idempotent() {
        let repo = widgets();
        let w = repo.create(NewWidget::named("a"), None).await.unwrap();

        assert!(repo.soft_delete(&w.id, Some("usr_1"), None).await.unwrap());
        let first = repo.find_by_id(&w.id, None).await.unwrap().unwrap();

        assert!(!repo.soft_delete(&w.id, Some("usr_2"), None).await.unwrap());
        let second = repo.find_by_id(&w.id, None).await.unwrap().unwrap();

        assert!(second.is_deleted);
        assert_eq!(first, second);
        assert!(repo.exists(&w.id, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_restore_keeps_audit_columns_by_default() {
        let repo = widgets();
        let w = repo.create(NewWidget::named("a"), None).await.unwrap();
        repo.soft_delete(&w.id, Some("usr_1"), None).await.unwrap();

        assert!(repo.restore(&w.id, None).await.unwrap());
        assert!(!repo.restore(&w.id, None).await.unwrap());

        let restored = repo.find_by_id(&w.id, None).await.unwrap().unwrap();
        assert!(!restored.is_deleted);
        assert_eq!(restored.deleted_by.as_deref(), Some("usr_1"));
    }

    #[tokio::test]
    async fn test_restore_can_clear_audit_columns() {
        let policy = SoftDeletePolicy::Flag {
            field: "is_deleted".to_string(),
            deleted_at_field: Some("deleted_at".to_string()),
            deleted_by_field: Some("deleted_by".to_string()),
            clear_audit_on_restore: true,
        };
        let repo = widgets().soft_delete_policy(policy);
        let w = repo.create(NewWidget::named("a"), None).await.unwrap();
        repo.soft_delete(&w.id, Some("usr_1"), None).await.unwrap();
        repo.restore(&w.id, None).await.unwrap();

        let restored = repo.find_by_id(&w.id, None).await.unwrap().unwrap();
        assert!(restored.deleted_by.is_none());
        assert!(restored.deleted_at.is_none());
    }

    #[tokio::test]
    async fn test_timestamp_policy() {
        let flagged = widgets();
        let repo = flagged.with_policy(SoftDeletePolicy::timestamp());
        let w = repo.create(NewWidget::named("a"), None).await.unwrap();

        assert!(repo.soft_delete(&w.id, None, None).await.unwrap());
        assert!(repo.find_all(&FindOptions::new(), None).await.unwrap().is_empty());
        let hidden = repo.find_by_id(&w.id, None).await.unwrap().unwrap();
        assert!(hidden.deleted_at.is_some());

        assert!(repo.restore(&w.id, None).await.unwrap());
        assert_eq!(repo.find_all(&FindOptions::new(), None).await.unwrap().len(), 1);

        // both repositories share the store
        assert!(flagged.find_by_id(&w.id, None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_disabled_policy() {
        let repo = widgets().soft_delete_policy(SoftDeletePolicy::Disabled);
        let w = repo.create(NewWidget::named("a"), None).await.unwrap();

        let err = repo.soft_delete(&w.id, None, None).await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.entity_id.as_deref(), Some(w.id.as_str()));
        assert!(repo.restore(&w.id, None).await.unwrap_err().is_validation());
        assert!(repo.find_deleted(&FindOptions::new(), None).await.unwrap_err().is_validation());
        assert_eq!(repo.find_all(&FindOptions::new(), None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_hooks_run_on_insert_and_update() {
        let repo = widgets().hook(LowercaseStrings::new());
        let w = repo.create(NewWidget::named("GEAR"), None).await.unwrap();
        assert_eq!(w.name, "gear");

        let updated = repo
            .update(&w.id, WidgetPatch::name("COG"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.name, "cog");
    }

    #[tokio::test]
    async fn test_query_bypasses_default_filter() {
        let store = MemoryStore::builder()
            .statement("widget_names", |tables: &MemoryTables, _params: &[Value]| {
                Ok(tables
                    .rows("widgets")
                    .iter()
                    .map(|row| {
                        let mut out = Record::new();
                        out.insert("name".to_string(), row.get("name").cloned().unwrap_or(Value::Null));
                        out
                    })
                    .collect())
            })
            .build();
        let repo: Widgets = GenericRepository::new(store);
        let rows = seed(&repo, &["a", "b"]).await;
        repo.soft_delete(&rows[0].id, None, None).await.unwrap();

        let raw = repo.query("widget_names", Vec::new(), None).await.unwrap();
        assert_eq!(raw.len(), 2);

        #[derive(serde::Deserialize)]
        struct NameOnly {
            name: String,
        }
        let typed: Vec<NameOnly> = repo.query_as("widget_names", vec![json!(1)], None).await.unwrap();
        assert_eq!(typed[1].name, "b");

        let err = repo.query("missing", Vec::new(), None).await.unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::DatabaseError);
        assert_eq!(err.operation, RepositoryOperation::Query);
    }

    #[tokio::test]
    async fn test_transaction_commits_all_writes() {
        let repo = &widgets();
        let session = repo.session();

        let created = repo
            .run_in_transaction(session.clone(), |tx| async move {
                let a = repo.create(NewWidget::named("a"), Some(&tx)).await?;
                let b = repo.create(NewWidget::named("b"), Some(&tx)).await?;
                repo.soft_delete(&a.id, None, Some(&tx)).await?;

                // the session sees its own writes, the default connection does not
                assert_eq!(repo.find_all(&FindOptions::new(), Some(&tx)).await?.len(), 1);
                assert!(repo.find_all(&FindOptions::new(), None).await?.is_empty());
                Ok::<_, RepositoryError>(vec![a, b])
            })
            .await
            .unwrap();

        assert_eq!(session.state(), SessionState::Released);
        assert_eq!(names(&repo.find_all(&FindOptions::new(), None).await.unwrap()), ["b"]);
        assert!(repo.find_by_id(&created[0].id, None).await.unwrap().unwrap().is_deleted);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_failure() {
        let repo = &widgets();
        let existing = repo.create(NewWidget::named("keep"), None).await.unwrap();
        let session = repo.session();

        let err = repo
            .run_in_transaction(session.clone(), |tx| async move {
                repo.create(NewWidget::named("a"), Some(&tx)).await?;
                repo.delete(&existing.id, Some(&tx)).await?;
                Err::<(), _>(RepositoryError::validation_failed(
                    RepositoryOperation::Create,
                    "quota exceeded",
                ))
            })
            .await
            .unwrap_err();

        // the work's own error comes back unchanged
        assert_eq!(err.message, "quota exceeded");
        assert_eq!(err.kind, RepositoryErrorKind::ValidationFailed);
        assert_eq!(session.state(), SessionState::Released);

        let all = repo.find_all(&FindOptions::new(), None).await.unwrap();
        assert_eq!(names(&all), ["keep"]);
    }

    #[tokio::test]
    async fn test_store_failure_inside_transaction_rolls_back() {
        let store = MemoryStore::builder()
            .table("widgets", TableSchema::new().unique("name"))
            .build();
        let repo: &Widgets = &GenericRepository::new(store);

        let err = repo
            .run_in_transaction(repo.session(), |tx| async move {
                repo.create(NewWidget::named("a"), Some(&tx)).await?;
                repo.create(NewWidget::named("a"), Some(&tx)).await?;
                Ok::<_, RepositoryError>(())
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind, RepositoryErrorKind::ConstraintViolation);
        assert_eq!(repo.count(&[], None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_operations_require_an_active_session() {
        let repo = widgets();
        let session = repo.session();

        let err = repo
            .create(NewWidget::named("a"), Some(&session))
            .await
            .unwrap_err();
        assert!(err.is_transaction());

        session.start().await.unwrap();
        session.rollback().await.unwrap();
        let err = repo.find_all(&FindOptions::new(), Some(&session)).await.unwrap_err();
        assert!(err.is_transaction());
    }

    #[tokio::test]
    async fn test_session_from_another_store_is_rejected() {
        let repo = widgets();
        let foreign = MemoryStore::new().session();
        foreign.start().await.unwrap();

        let err = repo
            .find_all(&FindOptions::new(), Some(&foreign))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::ValidationFailed);
        assert_eq!(err.operation, RepositoryOperation::FindAll);
    }

    #[tokio::test]
    async fn test_trash_reads_carry_their_own_operation() {
        let repo = widgets();
        let foreign = MemoryStore::new().session();
        foreign.start().await.unwrap();

        let err = repo
            .find_with_deleted(&FindOptions::new(), Some(&foreign))
            .await
            .unwrap_err();
        assert_eq!(err.operation, RepositoryOperation::FindWithDeleted);

        let err = repo
            .find_deleted(&FindOptions::new(), Some(&foreign))
            .await
            .unwrap_err();
        assert_eq!(err.operation, RepositoryOperation::FindDeleted);

        let disabled = widgets().soft_delete_policy(SoftDeletePolicy::Disabled);
        let err = disabled.find_deleted(&FindOptions::new(), None).await.unwrap_err();
        assert_eq!(err.operation, RepositoryOperation::FindDeleted);
    }
}
