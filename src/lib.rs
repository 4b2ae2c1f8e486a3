//! rowkeep - entity repositories over PostgreSQL
//!
//! Entities are registered in an explicit [`schema::Schema`], and every
//! entity type gets a [`repository::Repository`] for finds, persistence and
//! transactions.

pub mod cli;
pub mod config;
pub mod connection;
pub mod driver;
pub mod entity;
pub mod error;
pub mod persister;
pub mod query;
pub mod repository;
pub mod runner;
pub mod schema;

pub use connection::Connection;
pub use entity::{Entity, Record};
pub use error::AppError;
pub use query::{EntityId, Filter, FindOptions, Order};
pub use repository::Repository;

#[doc(hidden)]
pub use serde_json as __serde_json;
