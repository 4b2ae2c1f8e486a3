//! Core traits for the database driver seam.
//!
//! This module defines the trait hierarchy that backends must implement:
//!
//! - [`QueryRunner`] - One leased database session (statements + transaction lifecycle)
//! - [`Driver`] - Connection pool that hands out query runners

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::driver::row::Row;
use crate::error::AppError;

/// A leased database session.
///
/// A runner owns exactly one underlying connection from the time it is
/// created until [`release`](QueryRunner::release) is called. Statements use
/// positional `$n` placeholders; parameters are JSON values that the backend
/// converts to the server-side parameter types.
#[async_trait]
pub trait QueryRunner: Send + Sync {
    /// Executes a statement and collects every result row.
    async fn query(&self, sql: &str, params: &[JsonValue]) -> Result<Vec<Row>, AppError>;

    /// Executes a statement and returns the number of affected rows.
    async fn execute(&self, sql: &str, params: &[JsonValue]) -> Result<u64, AppError>;

    /// Starts a transaction on this session.
    ///
    /// Fails with [`AppError::TransactionAlreadyStarted`] if one is active.
    async fn start_transaction(&self) -> Result<(), AppError>;

    /// Commits the active transaction.
    async fn commit_transaction(&self) -> Result<(), AppError>;

    /// Rolls back the active transaction.
    async fn rollback_transaction(&self) -> Result<(), AppError>;

    /// Returns true while a transaction started on this runner is open.
    fn is_transaction_active(&self) -> bool;

    /// Returns the underlying connection to its pool.
    ///
    /// Any statement issued after release fails with [`AppError::RunnerReleased`].
    async fn release(&self) -> Result<(), AppError>;
}

/// A database driver that creates query runners.
///
/// Implementations typically wrap a connection pool; every call to
/// [`create_query_runner`](Driver::create_query_runner) leases one connection.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Leases a new query runner.
    async fn create_query_runner(&self) -> Result<Arc<dyn QueryRunner>, AppError>;
}
