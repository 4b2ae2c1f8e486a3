//! Entry point tying a driver to a schema.

use std::sync::Arc;

use crate::config::PostgresConfig;
use crate::driver::backends::postgres::PostgresDriver;
use crate::driver::{Driver, Row};
use crate::entity::Entity;
use crate::error::AppError;
use crate::repository::Repository;
use crate::runner::{with_runner, QueryRunnerProvider};
use crate::schema::Schema;

/// A database driver plus the entity schema it serves.
///
/// Cheap to clone; repositories handed out by [`Connection::repository`]
/// share the driver's pool.
///
/// # Example
///
/// ```ignore
/// let schema = Schema::builder()
///     .entity(EntityDefinition::table::<User>("users").column(ColumnMetadata::primary("id")))
///     .build()?;
/// let connection = Connection::connect(&config.postgres, schema).await?;
/// let users = connection.repository::<User>()?;
/// ```
#[derive(Clone)]
pub struct Connection {
    driver: Arc<dyn Driver>,
    schema: Arc<Schema>,
}

impl Connection {
    pub fn new(driver: Arc<dyn Driver>, schema: Arc<Schema>) -> Self {
        Self { driver, schema }
    }

    /// Connects to PostgreSQL.
    pub async fn connect(config: &PostgresConfig, schema: Arc<Schema>) -> Result<Self, AppError> {
        let driver = PostgresDriver::connect(config).await?;
        Ok(Self::new(Arc::new(driver), schema))
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// A repository for `E`.
    ///
    /// Fails with [`AppError::EntityNotRegistered`] if `E` is not in the schema.
    pub fn repository<E: Entity>(&self) -> Result<Repository<E>, AppError> {
        let metadata = self.schema.metadata_for::<E>()?;
        Ok(Repository::new(self.driver.clone(), metadata))
    }

    /// Runs a raw statement on a leased runner.
    pub async fn query(&self, sql: &str) -> Result<Vec<Row>, AppError> {
        let provider = Arc::new(QueryRunnerProvider::new(self.driver.clone(), false));
        with_runner(&provider, true, |runner| async move { runner.query(sql, &[]).await }).await
    }

    /// Checks that a connection can be leased and used.
    pub async fn ping(&self) -> Result<(), AppError> {
        self.query("SELECT 1").await.map(|_| ())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("schema", &self.schema)
            .finish()
    }
}
