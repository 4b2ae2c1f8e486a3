//! Translates entity records into INSERT, UPDATE and DELETE statements.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::driver::QueryRunner;
use crate::entity::{is_present, Record};
use crate::error::AppError;
use crate::schema::{ColumnMetadata, EntityMetadata};

/// Writes records of one entity type through a leased runner.
pub struct EntityPersister {
    metadata: Arc<EntityMetadata>,
    runner: Arc<dyn QueryRunner>,
}

/// Accumulates `$n` placeholders and their values for one statement.
#[derive(Default)]
struct Bindings {
    values: Vec<JsonValue>,
}

impl Bindings {
    fn bind(&mut self, value: JsonValue) -> String {
        self.values.push(value);
        format!("${}", self.values.len())
    }
}

impl EntityPersister {
    pub fn new(metadata: Arc<EntityMetadata>, runner: Arc<dyn QueryRunner>) -> Self {
        Self { metadata, runner }
    }

    /// Inserts or updates `record` and returns it with database-filled values.
    ///
    /// A record carrying its identity is updated; when no row matches it is
    /// inserted instead. Records without identity are always inserted.
    pub async fn persist(&self, record: Record) -> Result<Record, AppError> {
        if self.has_identity(&record) {
            if let Some(row) = self.update(&record).await? {
                return Ok(self.overlay(record, row));
            }
        }
        let row = self.insert(&record).await?;
        Ok(self.overlay(record, row))
    }

    /// Deletes the row identified by `record`.
    ///
    /// # Errors
    ///
    /// [`AppError::MissingIdentity`] if the record carries no identity.
    pub async fn remove(&self, record: &Record) -> Result<(), AppError> {
        if !self.has_identity(record) {
            return Err(AppError::MissingIdentity(self.metadata.target().to_string()));
        }

        let mut bindings = Bindings::default();
        let predicate = self.identity_predicate(record, &mut bindings);
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            self.metadata.table_name(),
            predicate
        );

        let affected = self.runner.execute(&sql, &bindings.values).await?;
        tracing::debug!(
            entity = %self.metadata.describe_identity(record),
            affected,
            "entity removed"
        );
        Ok(())
    }

    fn has_identity(&self, record: &Record) -> bool {
        let keys = self.metadata.key_columns();
        !keys.is_empty()
            && keys
                .iter()
                .all(|c| is_present(record.get(c.property_name())))
    }

    async fn insert(&self, record: &Record) -> Result<Record, AppError> {
        let mut bindings = Bindings::default();
        let mut columns = Vec::new();
        let mut placeholders = Vec::new();

        for column in self.metadata.columns() {
            let Some(value) = record.get(column.property_name()) else {
                continue;
            };
            if column.is_generated() && !is_present(Some(value)) {
                continue;
            }
            columns.push(column.name().to_string());
            placeholders.push(bindings.bind(value.clone()));
        }
        if let Some(discriminator) = self.metadata.discriminator() {
            columns.push(discriminator.column.clone());
            placeholders.push(bindings.bind(JsonValue::from(discriminator.value.as_str())));
        }

        let table = self.metadata.table_name();
        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES RETURNING {}", table, self.returning())
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
                table,
                columns.join(", "),
                placeholders.join(", "),
                self.returning()
            )
        };

        let rows = self.runner.query(&sql, &bindings.values).await?;
        let row = rows.first().map(|row| self.metadata.record_from_row(row));
        tracing::debug!(entity = self.metadata.target(), "entity inserted");
        Ok(row.unwrap_or_default())
    }

    /// Returns the updated row, or `None` if no row matches the identity.
    async fn update(&self, record: &Record) -> Result<Option<Record>, AppError> {
        let mut bindings = Bindings::default();
        let assignments: Vec<String> = self
            .metadata
            .columns()
            .iter()
            .filter(|c| !is_key(&self.metadata, c))
            .filter_map(|c| {
                record
                    .get(c.property_name())
                    .map(|value| format!("{} = {}", c.name(), bindings.bind(value.clone())))
            })
            .collect();

        let table = self.metadata.table_name();
        let predicate = self.identity_predicate(record, &mut bindings);

        let sql = if assignments.is_empty() {
            format!(
                "SELECT {} FROM {} WHERE {}",
                self.returning(),
                table,
                predicate
            )
        } else {
            format!(
                "UPDATE {} SET {} WHERE {} RETURNING {}",
                table,
                assignments.join(", "),
                predicate,
                self.returning()
            )
        };

        let rows = self.runner.query(&sql, &bindings.values).await?;
        let row = rows.first().map(|row| self.metadata.record_from_row(row));
        if row.is_some() {
            tracing::debug!(
                entity = %self.metadata.describe_identity(record),
                "entity updated"
            );
        }
        Ok(row)
    }

    fn identity_predicate(&self, record: &Record, bindings: &mut Bindings) -> String {
        let mut terms: Vec<String> = self
            .metadata
            .key_columns()
            .into_iter()
            .map(|c| {
                let value = record
                    .get(c.property_name())
                    .cloned()
                    .unwrap_or(JsonValue::Null);
                format!("{} = {}", c.name(), bindings.bind(value))
            })
            .collect();

        if self.metadata.filters_by_discriminator() {
            if let Some(discriminator) = self.metadata.discriminator() {
                let placeholder = bindings.bind(JsonValue::from(discriminator.value.as_str()));
                terms.push(format!("{} = {}", discriminator.column, placeholder));
            }
        }
        terms.join(" AND ")
    }

    fn returning(&self) -> String {
        self.metadata
            .columns()
            .iter()
            .map(|c| c.name())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn overlay(&self, mut record: Record, returned: Record) -> Record {
        record.extend(returned);
        record
    }
}

fn is_key(metadata: &EntityMetadata, column: &ColumnMetadata) -> bool {
    metadata
        .key_columns()
        .iter()
        .any(|k| k.property_name() == column.property_name())
}
