//! Backend implementations for different relational databases.
//!
//! Each backend implements the core traits from [`crate::driver::traits`]:
//!
//! - [`Driver`](crate::driver::Driver) - Required
//! - [`QueryRunner`](crate::driver::QueryRunner) - Required
//!
//! # Available Backends
//!
//! | Backend | Module | Status |
//! |---------|--------|--------|
//! | PostgreSQL | [`postgres`] | Available |
//!
//! # Implementing a Backend
//!
//! 1. Create a driver struct wrapping the connection pool (e.g., `PostgresDriver`)
//! 2. Create a runner struct owning one leased connection (e.g., `PostgresQueryRunner`)
//! 3. Implement `QueryRunner` for the runner, including transaction control
//! 4. Implement `Driver` for the driver

pub mod postgres;
