//! Application error types.

use thiserror::Error;

/// Errors produced by repositories, the query builder, the persister and drivers.
#[derive(Error, Debug)]
pub enum AppError {
    // Driver errors
    #[error("PostgreSQL error: {0}")]
    Connection(#[from] tokio_postgres::Error),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query error: {message}")]
    Query { message: String, query: String },

    #[error("Query runner was already released")]
    RunnerReleased,

    #[error("Transaction already started on this query runner")]
    TransactionAlreadyStarted,

    #[error("No active transaction on this query runner")]
    TransactionNotActive,

    // Query building errors
    #[error("Missing value for query parameter ':{0}'")]
    MissingParameter(String),

    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    // Schema errors
    #[error("Entity not registered in schema: {0}")]
    EntityNotRegistered(String),

    #[error("Schema error: {0}")]
    Schema(String),

    // Domain errors
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Entity {0} has no identity - primary key values are missing")]
    MissingIdentity(String),

    #[error("Validation error: {0}")]
    Validation(String),

    // Runtime errors
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Validation(format!("entity (de)serialization failed: {}", err))
    }
}
