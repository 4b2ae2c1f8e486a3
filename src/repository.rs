//! Per-entity repository: create, find, persist, remove and transactions.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::try_join_all;
use serde_json::Value as JsonValue;

use crate::driver::{Driver, QueryRunner, Row};
use crate::entity::{from_record, is_present, to_record, Entity, Record};
use crate::error::AppError;
use crate::persister::EntityPersister;
use crate::query::{Conditions, EntityId, Filter, FindOptions, SelectQueryBuilder};
use crate::runner::{self, finish, QueryRunnerProvider, RunnerLease, TransactionContext};
use crate::schema::EntityMetadata;

/// Type-safe access to the rows of one entity type.
///
/// Every operation leases a query runner, does its work and releases the
/// runner again, whether the work succeeded or not. A repository bound to a
/// [`TransactionContext`] leases the context's runner instead, so all of its
/// operations run on the enclosing transaction's connection.
///
/// # Example
///
/// ```ignore
/// let users = connection.repository::<User>()?;
///
/// let user = users.create_from(&json!({"name": "Ada"}))?;
/// let user = users.persist(user).await?;
///
/// let found = users.find_one_by_id(user.id, None).await?;
/// let adults = users
///     .find(FindOptions::new().alias("u").where_clause("u.age >= :age").parameter("age", 18))
///     .await?;
/// ```
pub struct Repository<E: Entity> {
    driver: Arc<dyn Driver>,
    metadata: Arc<EntityMetadata>,
    context: Option<TransactionContext>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Clone for Repository<E> {
    fn clone(&self) -> Self {
        Self {
            driver: self.driver.clone(),
            metadata: self.metadata.clone(),
            context: self.context.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> std::fmt::Debug for Repository<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("target", &self.metadata.target())
            .field("context", &self.context)
            .finish()
    }
}

impl<E: Entity> Repository<E> {
    pub fn new(driver: Arc<dyn Driver>, metadata: Arc<EntityMetadata>) -> Self {
        Self {
            driver,
            metadata,
            context: None,
            _entity: PhantomData,
        }
    }

    pub fn metadata(&self) -> &Arc<EntityMetadata> {
        &self.metadata
    }

    /// The transaction this repository runs in, if any.
    pub fn transaction_context(&self) -> Option<&TransactionContext> {
        self.context.as_ref()
    }

    /// A copy of this repository whose operations run in `context`.
    pub fn within(&self, context: &TransactionContext) -> Self {
        Self {
            context: Some(context.clone()),
            ..self.clone()
        }
    }

    // ---- create / merge ------------------------------------------------

    /// Returns true if every primary-key property of `entity` holds a value.
    ///
    /// An entity that does not serialize to an object has no identity; the
    /// serialization error is logged.
    pub fn has_id(&self, entity: &E) -> bool {
        match to_record(entity) {
            Ok(record) => self.metadata.has_id(&record),
            Err(error) => {
                tracing::warn!(
                    entity = self.metadata.target(),
                    error = %error,
                    "cannot read identity"
                );
                false
            }
        }
    }

    /// A new blank entity.
    pub fn create(&self) -> E {
        E::default()
    }

    /// A new entity holding the schema-known properties of `object`.
    pub fn create_from(&self, object: &JsonValue) -> Result<E, AppError> {
        let mut record = to_record(&E::default())?;
        record.extend(self.known_properties(object)?);
        from_record(record)
    }

    /// [`create_from`](Self::create_from) applied to each object in turn.
    pub fn create_many(&self, objects: &[JsonValue]) -> Result<Vec<E>, AppError> {
        objects.iter().map(|object| self.create_from(object)).collect()
    }

    /// Folds `objects` into one new entity; later objects win.
    pub fn merge(&self, objects: &[JsonValue]) -> Result<E, AppError> {
        let mut record = to_record(&E::default())?;
        for object in objects {
            record.extend(self.known_properties(object)?);
        }
        from_record(record)
    }

    /// Loads the entity identified by `object` and overlays `object` onto it.
    ///
    /// # Errors
    ///
    /// - [`AppError::Validation`] if `object` does not carry the entity's identity
    /// - [`AppError::EntityNotFound`] if no row matches
    pub async fn preload(&self, object: &JsonValue) -> Result<E, AppError> {
        let overlay = self.known_properties(object)?;
        let id = EntityId::Composite(overlay.clone().into_iter().collect());
        let conditions = self.id_conditions(id)?;

        let Some(entity) = self.find_one(conditions).await? else {
            return Err(AppError::EntityNotFound(
                self.metadata.describe_identity(&overlay),
            ));
        };

        let mut record = to_record(&entity)?;
        record.extend(overlay);
        from_record(record)
    }

    // ---- persist / remove ----------------------------------------------

    /// Inserts or updates `entity` and returns it with database-filled values.
    pub async fn persist(&self, entity: E) -> Result<E, AppError> {
        let record = to_record(&entity)?;
        let metadata = self.metadata.clone();

        let saved = self
            .with_runner(|runner| async move {
                EntityPersister::new(metadata, runner).persist(record).await
            })
            .await?;

        from_record(saved)
    }

    /// Persists every entity concurrently.
    ///
    /// The first failure is returned. Persists already issued for other
    /// entities are not cancelled; their results are discarded.
    pub async fn persist_all(&self, entities: Vec<E>) -> Result<Vec<E>, AppError> {
        let handles: Vec<_> = entities
            .into_iter()
            .map(|entity| {
                let repository = self.clone();
                tokio::spawn(async move { repository.persist(entity).await })
            })
            .collect();

        try_join_all(handles.into_iter().map(|handle| async move { handle.await? })).await
    }

    /// Deletes the row of `entity` and hands the entity back.
    pub async fn remove(&self, entity: E) -> Result<E, AppError> {
        let record = to_record(&entity)?;
        let metadata = self.metadata.clone();
        let (provider, owned) = self.provider(true);

        runner::with_runner(&provider, owned, |runner| async move {
            EntityPersister::new(metadata, runner).remove(&record).await
        })
        .await
        .map(|()| entity)
    }

    /// Removes every entity concurrently; same failure semantics as
    /// [`persist_all`](Self::persist_all).
    pub async fn remove_all(&self, entities: Vec<E>) -> Result<Vec<E>, AppError> {
        let handles: Vec<_> = entities
            .into_iter()
            .map(|entity| {
                let repository = self.clone();
                tokio::spawn(async move { repository.remove(entity).await })
            })
            .collect();

        try_join_all(handles.into_iter().map(|handle| async move { handle.await? })).await
    }

    // ---- find ----------------------------------------------------------

    /// A query builder over this entity with `filter` applied.
    ///
    /// The alias is the options' alias, or the table name.
    pub fn create_query_builder(&self, filter: &Filter) -> Result<SelectQueryBuilder, AppError> {
        let options = filter.options();
        let alias = options
            .and_then(|options| options.alias.as_deref())
            .unwrap_or_else(|| self.metadata.table_name());

        let mut qb = SelectQueryBuilder::from(self.metadata.clone(), alias)?;
        if let Some(options) = options {
            qb = options.apply(qb)?;
        }
        if let Some(conditions) = filter.conditions() {
            for (key, value) in conditions {
                qb = qb.and_where_equals(key, value.clone())?;
            }
        }
        Ok(qb)
    }

    pub async fn find_all(&self) -> Result<Vec<E>, AppError> {
        self.find(Filter::All).await
    }

    pub async fn find(&self, filter: impl Into<Filter>) -> Result<Vec<E>, AppError> {
        let qb = self.create_query_builder(&filter.into())?;
        let records = self
            .with_runner(|runner| async move { qb.get_results(runner.as_ref()).await })
            .await?;

        records.into_iter().map(|record| self.hydrate(record)).collect()
    }

    /// Matching entities plus the number of all matches, ignoring pagination.
    pub async fn find_and_count(
        &self,
        filter: impl Into<Filter>,
    ) -> Result<(Vec<E>, u64), AppError> {
        let qb = self.create_query_builder(&filter.into())?;
        let (records, count) = self
            .with_runner(|runner| async move { qb.get_results_and_count(runner.as_ref()).await })
            .await?;

        let entities = records
            .into_iter()
            .map(|record| self.hydrate(record))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((entities, count))
    }

    pub async fn find_one(&self, filter: impl Into<Filter>) -> Result<Option<E>, AppError> {
        let qb = self.create_query_builder(&filter.into())?;
        let record = self
            .with_runner(|runner| async move { qb.get_single_result(runner.as_ref()).await })
            .await?;

        record.map(|record| self.hydrate(record)).transpose()
    }

    /// Finds the entity with the given identity.
    ///
    /// Entities with a composite key need an [`EntityId::Composite`] holding
    /// every primary-key and parent-id property. Otherwise the id is bound to
    /// the sole primary key, or to the first parent-id column when there is
    /// no primary key.
    pub async fn find_one_by_id(
        &self,
        id: impl Into<EntityId>,
        options: Option<FindOptions>,
    ) -> Result<Option<E>, AppError> {
        let conditions = self.id_conditions(id.into())?;
        let filter = match options {
            Some(options) => Filter::Both(conditions, options),
            None => Filter::Conditions(conditions),
        };
        self.find_one(filter).await
    }

    /// Runs a raw statement and returns its rows.
    pub async fn query(&self, sql: &str) -> Result<Vec<Row>, AppError> {
        self.with_runner(|runner| async move { runner.query(sql, &[]).await })
            .await
    }

    // ---- transactions --------------------------------------------------

    /// Runs `work` in a transaction.
    ///
    /// `work` receives a repository bound to the transaction; repositories of
    /// other entity types join it through
    /// [`transaction_context`](Self::transaction_context) and
    /// [`within`](Self::within). The transaction commits when `work`
    /// succeeds and rolls back when it fails. Called from inside another
    /// transaction, `work` joins the open transaction instead of starting a
    /// new one. If the returned future is dropped before it completes, the
    /// transaction is rolled back and its runner released in the background.
    /// The context handed to `work` is closed once the transaction ends.
    ///
    /// # Errors
    ///
    /// The error of `work` or of the commit. If rolling back fails, the
    /// rollback error is returned instead and the original one is logged.
    pub async fn transaction<T, F, Fut>(&self, work: F) -> Result<T, AppError>
    where
        F: FnOnce(Repository<E>) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let (provider, owned) = self.provider(true);
        let lease = RunnerLease::acquire(provider.clone(), owned).await?;
        let runner = lease.runner().clone();
        let scoped = self.within(&TransactionContext::new(provider));

        let result = if runner.is_transaction_active() {
            tracing::debug!(entity = self.metadata.target(), "joining active transaction");
            work(scoped).await
        } else {
            run_in_transaction(runner.as_ref(), work(scoped)).await
        };

        finish(result, lease.release().await)
    }

    // ---- internals -----------------------------------------------------

    /// The context's provider, or a fresh one owned by the caller.
    fn provider(&self, use_single_runner: bool) -> (Arc<QueryRunnerProvider>, bool) {
        match &self.context {
            Some(context) => (context.provider().clone(), false),
            None => (
                Arc::new(QueryRunnerProvider::new(
                    self.driver.clone(),
                    use_single_runner,
                )),
                true,
            ),
        }
    }

    async fn with_runner<T, F, Fut>(&self, work: F) -> Result<T, AppError>
    where
        F: FnOnce(Arc<dyn QueryRunner>) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let (provider, owned) = self.provider(false);
        runner::with_runner(&provider, owned, work).await
    }

    fn hydrate(&self, record: Record) -> Result<E, AppError> {
        let mut base = to_record(&E::default())?;
        base.extend(record);
        from_record(base)
    }

    fn known_properties(&self, object: &JsonValue) -> Result<Record, AppError> {
        let JsonValue::Object(map) = object else {
            return Err(AppError::Validation(format!(
                "{} can only be created from an object, got {}",
                self.metadata.target(),
                object
            )));
        };
        Ok(map
            .iter()
            .filter(|(key, _)| self.metadata.has_property(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn id_conditions(&self, id: EntityId) -> Result<Conditions, AppError> {
        let target = self.metadata.target();
        let missing = |property: &str| {
            AppError::Validation(format!("{} id is missing a value for {}", target, property))
        };

        if self.metadata.has_multiple_primary_keys() {
            let EntityId::Composite(values) = id else {
                return Err(AppError::Validation(format!(
                    "{} has a composite primary key; pass one value per key property",
                    target
                )));
            };
            return self
                .metadata
                .primary_columns()
                .chain(self.metadata.parent_id_columns())
                .map(|column| {
                    let property = column.property_name();
                    match values.get(property) {
                        Some(value) if is_present(Some(value)) => {
                            Ok((property.to_string(), value.clone()))
                        }
                        _ => Err(missing(property)),
                    }
                })
                .collect();
        }

        let column = self
            .metadata
            .first_primary_column()
            .or_else(|| self.metadata.first_parent_id_column())
            .ok_or_else(|| AppError::Schema(format!("{} has no key column", target)))?;
        let property = column.property_name();

        let value = match id {
            EntityId::Scalar(value) => Some(value),
            EntityId::Composite(mut values) => values.remove(property),
        };
        match value {
            Some(value) if is_present(Some(&value)) => {
                Ok(Conditions::from([(property.to_string(), value)]))
            }
            _ => Err(missing(property)),
        }
    }
}

/// Begins a transaction on `runner`, awaits `work`, then commits or rolls back.
async fn run_in_transaction<T>(
    runner: &dyn QueryRunner,
    work: impl Future<Output = Result<T, AppError>>,
) -> Result<T, AppError> {
    runner.start_transaction().await?;
    tracing::debug!("transaction started");

    let result = match work.await {
        Ok(value) => runner.commit_transaction().await.map(|()| value),
        Err(error) => Err(error),
    };

    match result {
        Ok(value) => {
            tracing::debug!("transaction committed");
            Ok(value)
        }
        Err(error) if runner.is_transaction_active() => {
            match runner.rollback_transaction().await {
                Ok(()) => {
                    tracing::debug!(error = %error, "transaction rolled back");
                    Err(error)
                }
                Err(rollback_error) => {
                    tracing::error!(
                        error = %error,
                        rollback_error = %rollback_error,
                        "transaction rollback failed"
                    );
                    Err(rollback_error)
                }
            }
        }
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions;
    use crate::driver::mock::MockDriver;
    use crate::schema::{ColumnMetadata, EntityDefinition, Schema};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        id: Option<i64>,
        name: String,
        email: Option<String>,
    }

    impl Entity for User {
        const TARGET: &'static str = "User";
    }

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Membership {
        user_id: Option<i64>,
        group_id: Option<i64>,
        role: String,
    }

    impl Entity for Membership {
        const TARGET: &'static str = "Membership";
    }

    fn schema() -> Arc<Schema> {
        Schema::builder()
            .entity(
                EntityDefinition::table::<User>("users")
                    .column(ColumnMetadata::primary("id").generated())
                    .column(ColumnMetadata::new("name"))
                    .column(ColumnMetadata::new("email")),
            )
            .entity(
                EntityDefinition::table::<Membership>("memberships")
                    .column(ColumnMetadata::primary("user_id"))
                    .column(ColumnMetadata::primary("group_id"))
                    .column(ColumnMetadata::new("role")),
            )
            .build()
            .unwrap()
    }

    fn repository<E: Entity>(driver: &MockDriver) -> Repository<E> {
        Repository::new(
            Arc::new(driver.clone()),
            schema().metadata_for::<E>().unwrap(),
        )
    }

    /// Echoes written rows back and answers every SELECT with one stored user.
    fn user_store() -> MockDriver {
        MockDriver::with_responder(|sql, params| {
            if sql.starts_with("INSERT") {
                Ok(vec![Row::from([
                    ("id", json!(1)),
                    ("name", params[0].clone()),
                    ("email", JsonValue::Null),
                ])])
            } else if sql.starts_with("SELECT") || sql.starts_with("UPDATE") {
                Ok(vec![Row::from([
                    ("id", json!(1)),
                    ("name", json!("Ada")),
                    ("email", json!("ada@example.com")),
                ])])
            } else {
                Ok(Vec::new())
            }
        })
    }

    fn user(id: Option<i64>, name: &str) -> User {
        User {
            id,
            name: name.to_string(),
            email: None,
        }
    }

    #[test]
    fn test_has_id() {
        let users = repository::<User>(&MockDriver::new());
        assert!(users.has_id(&user(Some(1), "a")));
        assert!(!users.has_id(&user(None, "a")));
    }

    #[test]
    fn test_create_copies_known_properties_only() {
        let users = repository::<User>(&MockDriver::new());
        let objects = [json!({"name": "a", "bogus": 1}), json!({"name": "b", "id": 2})];

        let created = users.create_many(&objects).unwrap();
        assert_eq!(
            created,
            vec![
                users.create_from(&objects[0]).unwrap(),
                users.create_from(&objects[1]).unwrap()
            ]
        );
        assert_eq!(created[0], user(None, "a"));
        assert_eq!(created[1], user(Some(2), "b"));
        assert_eq!(users.create(), User::default());

        assert!(matches!(
            users.create_from(&json!([1, 2])),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_merge_later_objects_win() {
        let users = repository::<User>(&MockDriver::new());
        let merged = users
            .merge(&[
                json!({"name": "a", "email": "a@example.com"}),
                json!({"name": "b", "unknown": true}),
            ])
            .unwrap();

        assert_eq!(merged.name, "b");
        assert_eq!(merged.email.as_deref(), Some("a@example.com"));
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Tag(i64);

    impl Entity for Tag {
        const TARGET: &'static str = "Tag";
    }

    #[test]
    fn test_has_id_without_record_view() {
        let tags: Repository<Tag> = Repository::new(
            Arc::new(MockDriver::new()),
            schema().metadata_for::<User>().unwrap(),
        );
        assert!(!tags.has_id(&Tag(1)));
    }

    async fn wait_for_releases(driver: &MockDriver, count: usize) {
        for _ in 0..100 {
            if driver.runners_released() == count {
                break;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_persist_inserts_and_releases_runner() {
        let driver = user_store();
        let users = repository::<User>(&driver);

        let saved = users.persist(user(None, "Ada")).await.unwrap();

        assert_eq!(saved.id, Some(1));
        assert_eq!(
            driver.sql(),
            vec!["INSERT INTO users (name, email) VALUES ($1, $2) RETURNING id, name, email"]
        );
        assert_eq!(driver.runners_created(), 1);
        assert_eq!(driver.runners_released(), 1);
    }

    #[tokio::test]
    async fn test_persist_all_failure_does_not_cancel_siblings() {
        let driver = MockDriver::with_responder(|_, params| {
            if params.first() == Some(&json!("boom")) {
                Err(AppError::Validation("constraint violated".to_string()))
            } else {
                Ok(vec![Row::from([("id", json!(1)), ("name", json!("ok"))])])
            }
        });
        let users = repository::<User>(&driver);

        let result = users
            .persist_all(vec![user(None, "ok"), user(None, "boom")])
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));

        wait_for_releases(&driver, 2).await;
        let issued: Vec<_> = driver
            .statements()
            .into_iter()
            .filter(|s| s.sql.starts_with("INSERT"))
            .map(|s| s.params[0].clone())
            .collect();
        assert!(issued.contains(&json!("ok")));
        assert!(issued.contains(&json!("boom")));
        assert_eq!(driver.runners_released(), 2);
    }

    #[tokio::test]
    async fn test_persist_all_returns_in_order() {
        let driver = user_store();
        let users = repository::<User>(&driver);

        let saved = users
            .persist_all(vec![user(None, "a"), user(None, "b")])
            .await
            .unwrap();
        assert_eq!(saved[0].name, "a");
        assert_eq!(saved[1].name, "b");
    }

    #[tokio::test]
    async fn test_find_one_by_id() {
        let driver = user_store();
        let users = repository::<User>(&driver);

        let found = users.find_one_by_id(5, None).await.unwrap();

        assert_eq!(found.unwrap().name, "Ada");
        let statements = driver.statements();
        assert_eq!(
            statements[0].sql,
            "SELECT users.id, users.name, users.email FROM users WHERE users.id = $1 LIMIT 1"
        );
        assert_eq!(statements[0].params, vec![json!(5)]);
    }

    #[tokio::test]
    async fn test_find_one_by_id_absent() {
        let driver = MockDriver::new();
        let users = repository::<User>(&driver);
        assert!(users.find_one_by_id(5, None).await.unwrap().is_none());
        assert_eq!(driver.runners_released(), 1);
    }

    #[tokio::test]
    async fn test_find_one_by_composite_id() {
        let driver = MockDriver::new();
        let memberships = repository::<Membership>(&driver);

        memberships
            .find_one_by_id(json!({"user_id": 1, "group_id": 2}), None)
            .await
            .unwrap();
        assert_eq!(
            driver.sql()[0],
            "SELECT memberships.user_id, memberships.group_id, memberships.role FROM memberships \
             WHERE memberships.group_id = $1 AND memberships.user_id = $2 LIMIT 1"
        );

        let result = memberships.find_one_by_id(1, None).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        let result = memberships
            .find_one_by_id(json!({"user_id": 1}), None)
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_find_with_conditions_and_options() {
        let driver = user_store();
        let users = repository::<User>(&driver);

        let found = users
            .find((
                conditions! { name = "a" },
                FindOptions::new().alias("u").max_results(10),
            ))
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        let statements = driver.statements();
        assert_eq!(
            statements[0].sql,
            "SELECT u.id, u.name, u.email FROM users u WHERE u.name = $1 LIMIT 10"
        );
        assert_eq!(statements[0].params, vec![json!("a")]);
    }

    #[tokio::test]
    async fn test_find_all_is_unfiltered() {
        let driver = user_store();
        let users = repository::<User>(&driver);

        users.find_all().await.unwrap();
        assert_eq!(
            driver.sql(),
            vec!["SELECT users.id, users.name, users.email FROM users"]
        );
    }

    #[tokio::test]
    async fn test_find_and_count_ignores_pagination() {
        let driver = MockDriver::with_responder(|sql, _| {
            if sql.starts_with("SELECT COUNT") {
                Ok(vec![Row::from([("count", json!(12))])])
            } else {
                Ok(vec![Row::from([("id", json!(1)), ("name", json!("a"))])])
            }
        });
        let users = repository::<User>(&driver);

        let (found, count) = users
            .find_and_count(FindOptions::new().first_result(10).max_results(1))
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(count, 12);
        assert_eq!(
            driver.sql()[1],
            "SELECT COUNT(DISTINCT users.id) AS count FROM users"
        );
        assert_eq!(driver.runners_created(), 1);
    }

    #[tokio::test]
    async fn test_preload_overlays_object() {
        let driver = user_store();
        let users = repository::<User>(&driver);

        let preloaded = users
            .preload(&json!({"id": 1, "name": "Grace"}))
            .await
            .unwrap();
        assert_eq!(preloaded.name, "Grace");
        assert_eq!(preloaded.email.as_deref(), Some("ada@example.com"));

        users.persist(preloaded).await.unwrap();
        let update = driver
            .statements()
            .into_iter()
            .find(|s| s.sql.starts_with("UPDATE"))
            .unwrap();
        assert_eq!(
            update.sql,
            "UPDATE users SET name = $1, email = $2 WHERE id = $3 RETURNING id, name, email"
        );
        assert_eq!(
            update.params,
            vec![json!("Grace"), json!("ada@example.com"), json!(1)]
        );
    }

    #[tokio::test]
    async fn test_preload_missing_row() {
        let driver = MockDriver::new();
        let users = repository::<User>(&driver);

        let result = users.preload(&json!({"id": 9})).await;
        assert!(matches!(result, Err(AppError::EntityNotFound(_))));

        let result = users.preload(&json!({"name": "no id"})).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_remove_releases_reusable_runner() {
        let driver = MockDriver::new();
        let users = repository::<User>(&driver);

        users.remove(user(Some(3), "a")).await.unwrap();

        assert_eq!(driver.sql(), vec!["DELETE FROM users WHERE id = $1"]);
        assert_eq!(driver.runners_created(), 1);
        assert_eq!(driver.runners_released(), 1);

        let result = users.remove(user(None, "a")).await;
        assert!(matches!(result, Err(AppError::MissingIdentity(_))));
        assert_eq!(driver.runners_released(), 2);
    }

    #[tokio::test]
    async fn test_raw_query() {
        let driver = MockDriver::with_responder(|_, _| Ok(vec![Row::from([("one", json!(1))])]));
        let users = repository::<User>(&driver);

        let rows = users.query("SELECT 1 AS one").await.unwrap();
        assert_eq!(rows[0].get::<i64>("one").unwrap(), 1);
        assert_eq!(driver.runners_released(), 1);
    }

    #[tokio::test]
    async fn test_transaction_commits_on_one_runner() {
        let driver = user_store();
        let users = repository::<User>(&driver);

        let saved = users
            .transaction(|users| async move {
                let a = users.persist(user(None, "a")).await?;
                let b = users.persist(user(None, "b")).await?;
                Ok((a, b))
            })
            .await
            .unwrap();

        assert_eq!(saved.0.name, "a");
        let statements = driver.statements();
        let sql: Vec<_> = statements.iter().map(|s| s.sql.as_str()).collect();
        assert_eq!(sql[0], "BEGIN");
        assert!(sql[1].starts_with("INSERT"));
        assert!(sql[2].starts_with("INSERT"));
        assert_eq!(sql[3], "COMMIT");
        assert!(statements.iter().all(|s| s.runner == 1));
        assert_eq!(driver.runners_created(), 1);
        assert_eq!(driver.runners_released(), 1);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let driver = user_store();
        let users = repository::<User>(&driver);

        let result: Result<(), AppError> = users
            .transaction(|users| async move {
                users.persist(user(None, "x")).await?;
                Err(AppError::Validation("abort".to_string()))
            })
            .await;

        assert!(matches!(result, Err(AppError::Validation(message)) if message == "abort"));
        let sql = driver.sql();
        assert_eq!(sql.first().map(String::as_str), Some("BEGIN"));
        assert_eq!(sql.last().map(String::as_str), Some("ROLLBACK"));
        assert!(!sql.iter().any(|s| s == "COMMIT"));
        assert_eq!(driver.runners_released(), 1);
    }

    #[tokio::test]
    async fn test_rollback_failure_masks_original_error() {
        let driver = MockDriver::with_responder(|sql, _| {
            if sql == "ROLLBACK" {
                Err(AppError::Internal("connection lost".to_string()))
            } else {
                Ok(Vec::new())
            }
        });
        let users = repository::<User>(&driver);

        let result: Result<(), AppError> = users
            .transaction(|_| async { Err(AppError::Validation("abort".to_string())) })
            .await;

        assert!(matches!(result, Err(AppError::Internal(message)) if message == "connection lost"));
        assert_eq!(driver.runners_released(), 1);
    }

    #[tokio::test]
    async fn test_begin_failure_is_not_rolled_back() {
        let driver = MockDriver::with_responder(|sql, _| {
            if sql == "BEGIN" {
                Err(AppError::Internal("no begin".to_string()))
            } else {
                Ok(Vec::new())
            }
        });
        let users = repository::<User>(&driver);

        let result = users.transaction(|_| async { Ok(()) }).await;

        assert!(matches!(result, Err(AppError::Internal(_))));
        assert_eq!(driver.sql(), vec!["BEGIN"]);
        assert_eq!(driver.runners_released(), 1);
    }

    #[tokio::test]
    async fn test_nested_transaction_joins_outer() {
        let driver = user_store();
        let users = repository::<User>(&driver);
        let memberships = repository::<Membership>(&driver);

        users
            .transaction(|users| async move {
                let context = users.transaction_context().cloned().unwrap();
                users
                    .transaction(|inner| async move {
                        inner.persist(user(None, "nested")).await?;
                        Ok(())
                    })
                    .await?;
                memberships
                    .within(&context)
                    .remove(Membership {
                        user_id: Some(1),
                        group_id: Some(2),
                        role: "owner".to_string(),
                    })
                    .await?;
                Ok(())
            })
            .await
            .unwrap();

        let statements = driver.statements();
        let sql: Vec<_> = statements.iter().map(|s| s.sql.as_str()).collect();
        assert_eq!(sql.iter().filter(|s| **s == "BEGIN").count(), 1);
        assert_eq!(sql.iter().filter(|s| **s == "COMMIT").count(), 1);
        assert_eq!(
            sql[2],
            "DELETE FROM memberships WHERE user_id = $1 AND group_id = $2"
        );
        assert!(statements.iter().all(|s| s.runner == 1));
        assert_eq!(driver.runners_created(), 1);
        assert_eq!(driver.runners_released(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_transaction_rolls_back_and_releases() {
        let driver = user_store();
        let users = repository::<User>(&driver);

        let result = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            users.transaction(|_| async {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                Ok(())
            }),
        )
        .await;
        assert!(result.is_err());

        wait_for_releases(&driver, 1).await;
        assert_eq!(driver.sql(), vec!["BEGIN", "ROLLBACK"]);
        assert_eq!(driver.runners_created(), 1);
        assert_eq!(driver.runners_released(), 1);
    }

    #[tokio::test]
    async fn test_context_is_closed_after_transaction() {
        let driver = user_store();
        let users = repository::<User>(&driver);

        let (context, scoped) = users
            .transaction(|scoped| async move {
                let context = scoped.transaction_context().cloned().unwrap();
                Ok((context, scoped))
            })
            .await
            .unwrap();

        let result = users.within(&context).find_all().await;
        assert!(matches!(result, Err(AppError::RunnerReleased)));
        let result = scoped.persist(user(None, "late")).await;
        assert!(matches!(result, Err(AppError::RunnerReleased)));

        assert_eq!(driver.sql(), vec!["BEGIN", "COMMIT"]);
        assert_eq!(driver.runners_created(), 1);
        assert_eq!(driver.runners_released(), 1);
    }
}
