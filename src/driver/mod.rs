//! Driver abstraction layer for backend-agnostic database access.
//!
//! This module provides a trait-based abstraction over relational databases,
//! so repositories, the query builder and the persister work the same way
//! against any backend (PostgreSQL today).
//!
//! # Architecture
//!
//! - [`Driver`] - Connection pool; leases query runners
//! - [`QueryRunner`] - One leased session: statements and transaction control
//! - [`Row`] - Backend-neutral result row (column name → JSON value)
//!
//! # Usage
//!
//! ```ignore
//! use rowkeep::driver::{Driver, QueryRunner};
//!
//! let runner = driver.create_query_runner().await?;
//! runner.start_transaction().await?;
//! runner.execute("UPDATE users SET name = $1 WHERE id = $2", &[json!("ada"), json!(1)]).await?;
//! runner.commit_transaction().await?;
//! runner.release().await?;
//! ```

mod row;
mod traits;

pub mod backends;

#[cfg(test)]
pub(crate) mod mock;

pub use row::Row;
pub use traits::{Driver, QueryRunner};
