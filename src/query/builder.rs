//! Builder for SELECT statements over one entity table.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::driver::QueryRunner;
use crate::entity::Record;
use crate::error::AppError;
use crate::query::params::bind_named;
use crate::query::{validate_identifier, Order, Parameters};
use crate::schema::EntityMetadata;

/// Parameter name carrying a single-table child's discriminator value.
///
/// Bound apart from the user-supplied parameters; setting a parameter of
/// this name is an error at build time.
pub const DISCRIMINATOR_PARAMETER: &str = "__discriminator";

/// A builder for constructing and executing SELECT queries for one entity.
///
/// The builder selects every mapped column of the entity under the given
/// alias and maps result rows back to property-keyed records.
#[derive(Debug, Clone)]
pub struct SelectQueryBuilder {
    metadata: Arc<EntityMetadata>,
    alias: String,
    joins: Vec<String>,
    wheres: Vec<String>,
    order_by: Vec<(String, Order)>,
    first_result: Option<u64>,
    max_results: Option<u64>,
    parameters: Parameters,
    discriminator: Option<JsonValue>,
}

impl SelectQueryBuilder {
    /// Starts a query over the entity's table under `alias`.
    ///
    /// Single-table children are restricted to rows carrying their
    /// discriminator value.
    pub fn from(metadata: Arc<EntityMetadata>, alias: &str) -> Result<Self, AppError> {
        validate_identifier(alias)?;

        let mut qb = Self {
            metadata,
            alias: alias.to_string(),
            joins: Vec::new(),
            wheres: Vec::new(),
            order_by: Vec::new(),
            first_result: None,
            max_results: None,
            parameters: Parameters::new(),
            discriminator: None,
        };

        if qb.metadata.filters_by_discriminator() {
            if let Some(discriminator) = qb.metadata.discriminator().cloned() {
                let condition = format!(
                    "{}.{} = :{}",
                    qb.alias, discriminator.column, DISCRIMINATOR_PARAMETER
                );
                qb = qb.and_where(condition);
                qb.discriminator = Some(JsonValue::from(discriminator.value));
            }
        }

        Ok(qb)
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn metadata(&self) -> &Arc<EntityMetadata> {
        &self.metadata
    }

    /// Parameters set on this builder. The discriminator value of a
    /// single-table child is not among them.
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// Adds a raw predicate, ANDed with the existing ones.
    pub fn and_where(mut self, condition: impl Into<String>) -> Self {
        self.wheres.push(condition.into());
        self
    }

    /// Adds an equality predicate for `key`, binding `value` as a parameter.
    ///
    /// A key containing `.` is used as-is; otherwise it is qualified with the
    /// query alias, translating a property name to its column name. The
    /// parameter is named after the key with `.` replaced by `_`, suffixed
    /// with `_1`, `_2`, ... if that name is already taken. A null value
    /// produces `IS NULL`.
    pub fn and_where_equals(self, key: &str, value: JsonValue) -> Result<Self, AppError> {
        let column = self.qualify(key)?;
        if value.is_null() {
            return Ok(self.and_where(format!("{} IS NULL", column)));
        }

        let parameter = self.unused_parameter_name(key.replace('.', "_"));
        Ok(self
            .and_where(format!("{} = :{}", column, parameter))
            .set_parameter(&parameter, value))
    }

    pub fn set_parameter(mut self, name: &str, value: impl Into<JsonValue>) -> Self {
        self.parameters.insert(name.to_string(), value.into());
        self
    }

    pub fn add_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters.extend(parameters);
        self
    }

    pub fn inner_join(self, table: &str, alias: &str, condition: &str) -> Result<Self, AppError> {
        self.join("INNER JOIN", table, alias, condition)
    }

    pub fn left_join(self, table: &str, alias: &str, condition: &str) -> Result<Self, AppError> {
        self.join("LEFT JOIN", table, alias, condition)
    }

    fn join(
        mut self,
        keyword: &str,
        table: &str,
        alias: &str,
        condition: &str,
    ) -> Result<Self, AppError> {
        validate_identifier(table)?;
        validate_identifier(alias)?;
        self.joins
            .push(format!("{} {} {} ON {}", keyword, table, alias, condition));
        Ok(self)
    }

    /// Replaces the ordering.
    pub fn order_by(mut self, sort: &str, order: Order) -> Result<Self, AppError> {
        let sort = self.qualify(sort)?;
        self.order_by = vec![(sort, order)];
        Ok(self)
    }

    /// Appends to the ordering.
    pub fn add_order_by(mut self, sort: &str, order: Order) -> Result<Self, AppError> {
        let sort = self.qualify(sort)?;
        self.order_by.push((sort, order));
        Ok(self)
    }

    pub fn first_result(mut self, first_result: u64) -> Self {
        self.first_result = Some(first_result);
        self
    }

    pub fn max_results(mut self, max_results: u64) -> Self {
        self.max_results = Some(max_results);
        self
    }

    /// The SELECT statement with named parameters.
    pub fn get_query(&self) -> String {
        let columns: Vec<String> = self
            .metadata
            .columns()
            .iter()
            .map(|c| format!("{}.{}", self.alias, c.name()))
            .collect();

        let mut sql = format!("SELECT {} {}", columns.join(", "), self.from_clause());
        self.push_where(&mut sql);

        let order_by = self.effective_order_by();
        if !order_by.is_empty() {
            let terms: Vec<String> = order_by
                .iter()
                .map(|(sort, order)| format!("{} {}", sort, order))
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&terms.join(", "));
        }
        if let Some(max_results) = self.max_results {
            sql.push_str(&format!(" LIMIT {}", max_results));
        }
        if let Some(first_result) = self.first_result {
            sql.push_str(&format!(" OFFSET {}", first_result));
        }
        sql
    }

    /// The COUNT statement with named parameters; ignores ordering and pagination.
    pub fn get_count_query(&self) -> String {
        let counted = match (
            self.metadata.has_multiple_primary_keys(),
            self.metadata.first_primary_column(),
        ) {
            (false, Some(column)) => format!("DISTINCT {}.{}", self.alias, column.name()),
            _ => "*".to_string(),
        };

        let mut sql = format!("SELECT COUNT({}) AS count {}", counted, self.from_clause());
        self.push_where(&mut sql);
        sql
    }

    /// The SELECT statement with positional placeholders and their values.
    pub fn build(&self) -> Result<(String, Vec<JsonValue>), AppError> {
        bind_named(&self.get_query(), &self.bound_parameters()?)
    }

    /// Executes the query and maps every row to a record.
    pub async fn get_results(&self, runner: &dyn QueryRunner) -> Result<Vec<Record>, AppError> {
        let (sql, params) = self.build()?;
        let rows = runner.query(&sql, &params).await?;
        Ok(rows
            .iter()
            .map(|row| self.metadata.record_from_row(row))
            .collect())
    }

    /// Executes the query plus a count of all matches regardless of pagination.
    pub async fn get_results_and_count(
        &self,
        runner: &dyn QueryRunner,
    ) -> Result<(Vec<Record>, u64), AppError> {
        let records = self.get_results(runner).await?;

        let (sql, params) = bind_named(&self.get_count_query(), &self.bound_parameters()?)?;
        let rows = runner.query(&sql, &params).await?;
        let count = match rows.first() {
            Some(row) => row.get::<u64>("count")?,
            None => 0,
        };

        Ok((records, count))
    }

    /// Executes the query and returns the first record, if any.
    ///
    /// Limits the statement to one row unless a limit was already set.
    pub async fn get_single_result(
        &self,
        runner: &dyn QueryRunner,
    ) -> Result<Option<Record>, AppError> {
        let qb = if self.max_results.is_some() {
            self.clone()
        } else {
            self.clone().max_results(1)
        };
        Ok(qb.get_results(runner).await?.into_iter().next())
    }

    fn unused_parameter_name(&self, base: String) -> String {
        let taken =
            |name: &str| name == DISCRIMINATOR_PARAMETER || self.parameters.contains_key(name);
        let mut name = base.clone();
        let mut suffix = 1;
        while taken(&name) {
            name = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        name
    }

    /// The user parameters plus the discriminator value.
    fn bound_parameters(&self) -> Result<Parameters, AppError> {
        if self.parameters.contains_key(DISCRIMINATOR_PARAMETER) {
            return Err(AppError::Validation(format!(
                "Parameter name '{}' is reserved",
                DISCRIMINATOR_PARAMETER
            )));
        }
        let mut parameters = self.parameters.clone();
        if let Some(value) = &self.discriminator {
            parameters.insert(DISCRIMINATOR_PARAMETER.to_string(), value.clone());
        }
        Ok(parameters)
    }

    fn qualify(&self, key: &str) -> Result<String, AppError> {
        validate_identifier(key)?;
        if key.contains('.') {
            return Ok(key.to_string());
        }
        let column = self
            .metadata
            .column_by_property(key)
            .map(|c| c.name())
            .unwrap_or(key);
        Ok(format!("{}.{}", self.alias, column))
    }

    fn from_clause(&self) -> String {
        let table = self.metadata.table_name();
        let mut clause = if self.alias == table {
            format!("FROM {}", table)
        } else {
            format!("FROM {} {}", table, self.alias)
        };
        for join in &self.joins {
            clause.push(' ');
            clause.push_str(join);
        }
        clause
    }

    fn push_where(&self, sql: &mut String) {
        if !self.wheres.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.wheres.join(" AND "));
        }
    }

    fn effective_order_by(&self) -> Vec<(String, Order)> {
        if !self.order_by.is_empty() {
            return self.order_by.clone();
        }
        // Entries were validated when the schema was built.
        self.metadata
            .table()
            .order_by()
            .iter()
            .filter_map(|(sort, order)| self.qualify(sort).ok().map(|sort| (sort, *order)))
            .collect()
    }
}
