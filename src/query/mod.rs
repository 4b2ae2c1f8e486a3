//! SELECT query construction and find-option translation.
//!
//! # Usage
//!
//! ```ignore
//! use rowkeep::query::{FindOptions, Order, SelectQueryBuilder};
//!
//! let users = SelectQueryBuilder::from(metadata, "u")?
//!     .and_where("u.age > :age")
//!     .set_parameter("age", 18)
//!     .order_by("name", Order::Asc)?
//!     .max_results(10)
//!     .get_results(runner.as_ref())
//!     .await?;
//! ```
//!
//! Statements are written with named parameters (`:name`) and bound to
//! positional placeholders (`$1`, `$2`, ...) right before execution.

mod builder;
mod macros;
mod options;
mod params;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub use builder::{SelectQueryBuilder, DISCRIMINATOR_PARAMETER};
pub use options::{EntityId, Filter, FindOptions, JoinKind, JoinOption};
pub use params::bind_named;

use crate::error::AppError;

/// Named query parameters.
pub type Parameters = BTreeMap<String, JsonValue>;

/// Equality conditions, keyed by property name or qualified `alias.column`.
pub type Conditions = BTreeMap<String, JsonValue>;

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Order::Asc => write!(f, "ASC"),
            Order::Desc => write!(f, "DESC"),
        }
    }
}

/// Checks that a table, alias or column reference is a plain (optionally
/// dotted) identifier and returns it unchanged.
pub fn validate_identifier(identifier: &str) -> Result<&str, AppError> {
    let valid = !identifier.is_empty()
        && identifier.split('.').all(|part| {
            let mut chars = part.chars();
            chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });

    if valid {
        Ok(identifier)
    } else {
        Err(AppError::InvalidIdentifier(identifier.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("u.first_name").is_ok());
        assert!(validate_identifier("_tmp1").is_ok());

        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("u.").is_err());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("name; DROP TABLE users").is_err());
        assert!(validate_identifier("name\"").is_err());
    }

    #[test]
    fn test_order_display() {
        assert_eq!(Order::Asc.to_string(), "ASC");
        assert_eq!(Order::Desc.to_string(), "DESC");
    }
}
