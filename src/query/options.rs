//! Find options and the tagged filter/id inputs of repository finds.

use serde_json::Value as JsonValue;

use crate::error::AppError;
use crate::query::builder::SelectQueryBuilder;
use crate::query::{Conditions, Order, Parameters};

/// Kind of SQL join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

/// A join added to a find query.
///
/// Joined tables narrow or widen the matched rows; only the entity's own
/// columns are selected.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOption {
    pub kind: JoinKind,
    pub table: String,
    pub alias: String,
    /// Raw join condition, may reference named parameters.
    pub condition: String,
}

/// Structured query configuration for repository finds.
///
/// # Example
///
/// ```ignore
/// let options = FindOptions::new()
///     .alias("u")
///     .where_clause("u.age >= :age")
///     .parameter("age", 18)
///     .order_by("name", Order::Asc)
///     .max_results(10);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Query alias; defaults to the table name.
    pub alias: Option<String>,
    /// Raw condition, ANDed (parenthesised) with everything else.
    pub where_clause: Option<String>,
    /// Equality conditions, resolved the same way as plain conditions.
    pub where_conditions: Conditions,
    pub joins: Vec<JoinOption>,
    pub order_by: Vec<(String, Order)>,
    /// Rows to skip (OFFSET).
    pub first_result: Option<u64>,
    /// Maximum rows to return (LIMIT).
    pub max_results: Option<u64>,
    pub parameters: Parameters,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    pub fn where_clause(mut self, condition: &str) -> Self {
        self.where_clause = Some(condition.to_string());
        self
    }

    pub fn where_equals(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.where_conditions.insert(key.to_string(), value.into());
        self
    }

    pub fn inner_join(mut self, table: &str, alias: &str, condition: &str) -> Self {
        self.joins.push(JoinOption {
            kind: JoinKind::Inner,
            table: table.to_string(),
            alias: alias.to_string(),
            condition: condition.to_string(),
        });
        self
    }

    pub fn left_join(mut self, table: &str, alias: &str, condition: &str) -> Self {
        self.joins.push(JoinOption {
            kind: JoinKind::Left,
            table: table.to_string(),
            alias: alias.to_string(),
            condition: condition.to_string(),
        });
        self
    }

    pub fn order_by(mut self, sort: &str, order: Order) -> Self {
        self.order_by.push((sort.to_string(), order));
        self
    }

    pub fn first_result(mut self, first_result: u64) -> Self {
        self.first_result = Some(first_result);
        self
    }

    pub fn max_results(mut self, max_results: u64) -> Self {
        self.max_results = Some(max_results);
        self
    }

    pub fn parameter(mut self, name: &str, value: impl Into<JsonValue>) -> Self {
        self.parameters.insert(name.to_string(), value.into());
        self
    }

    /// Applies these options to a query builder.
    ///
    /// Explicit parameters are bound first, so the parameters generated for
    /// equality conditions take names that do not collide with them.
    pub fn apply(&self, qb: SelectQueryBuilder) -> Result<SelectQueryBuilder, AppError> {
        let mut qb = qb.add_parameters(self.parameters.clone());
        for join in &self.joins {
            qb = match join.kind {
                JoinKind::Inner => qb.inner_join(&join.table, &join.alias, &join.condition)?,
                JoinKind::Left => qb.left_join(&join.table, &join.alias, &join.condition)?,
            };
        }
        if let Some(condition) = &self.where_clause {
            qb = qb.and_where(format!("({})", condition));
        }
        for (key, value) in &self.where_conditions {
            qb = qb.and_where_equals(key, value.clone())?;
        }
        for (sort, order) in &self.order_by {
            qb = qb.add_order_by(sort, *order)?;
        }
        if let Some(first_result) = self.first_result {
            qb = qb.first_result(first_result);
        }
        if let Some(max_results) = self.max_results {
            qb = qb.max_results(max_results);
        }
        Ok(qb)
    }
}

/// What a find should match.
///
/// Replaces positional-argument probing: exactly one variant says whether
/// plain conditions, find options, both, or neither were given.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Filter {
    /// Every row of the entity's table.
    #[default]
    All,
    Conditions(Conditions),
    Options(FindOptions),
    Both(Conditions, FindOptions),
}

impl Filter {
    pub fn conditions(&self) -> Option<&Conditions> {
        match self {
            Filter::Conditions(conditions) | Filter::Both(conditions, _) => Some(conditions),
            Filter::All | Filter::Options(_) => None,
        }
    }

    pub fn options(&self) -> Option<&FindOptions> {
        match self {
            Filter::Options(options) | Filter::Both(_, options) => Some(options),
            Filter::All | Filter::Conditions(_) => None,
        }
    }
}

impl From<Conditions> for Filter {
    fn from(conditions: Conditions) -> Self {
        Filter::Conditions(conditions)
    }
}

impl From<FindOptions> for Filter {
    fn from(options: FindOptions) -> Self {
        Filter::Options(options)
    }
}

impl From<(Conditions, FindOptions)> for Filter {
    fn from((conditions, options): (Conditions, FindOptions)) -> Self {
        Filter::Both(conditions, options)
    }
}

/// Identity passed to `find_one_by_id`.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityId {
    /// Value of the sole primary-key (or first parent-id) property.
    Scalar(JsonValue),
    /// One value per key property, keyed by property name.
    Composite(Conditions),
}

impl From<JsonValue> for EntityId {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Object(map) => EntityId::Composite(map.into_iter().collect()),
            other => EntityId::Scalar(other),
        }
    }
}

impl From<Conditions> for EntityId {
    fn from(values: Conditions) -> Self {
        EntityId::Composite(values)
    }
}

macro_rules! scalar_id_from {
    ($($ty:ty),+) => {
        $(
            impl From<$ty> for EntityId {
                fn from(value: $ty) -> Self {
                    EntityId::Scalar(JsonValue::from(value))
                }
            }
        )+
    };
}

scalar_id_from!(i32, i64, u32, u64, &str, String);
