//! Resolved, immutable metadata for one entity type.

use crate::driver::Row;
use crate::entity::{is_present, Record};
use crate::query::Order;

/// Role of a column in the entity's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnMode {
    Regular,
    Primary,
    /// Column holding the id of the parent table's row (inheritance mapping).
    ParentId,
}

/// Maps one entity property to one table column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMetadata {
    property_name: String,
    name: String,
    mode: ColumnMode,
    generated: bool,
}

impl ColumnMetadata {
    /// A regular column whose name equals the property name.
    pub fn new(property_name: &str) -> Self {
        Self {
            property_name: property_name.to_string(),
            name: property_name.to_string(),
            mode: ColumnMode::Regular,
            generated: false,
        }
    }

    /// A primary-key column.
    pub fn primary(property_name: &str) -> Self {
        Self {
            mode: ColumnMode::Primary,
            ..Self::new(property_name)
        }
    }

    /// A parent-id column.
    pub fn parent_id(property_name: &str) -> Self {
        Self {
            mode: ColumnMode::ParentId,
            ..Self::new(property_name)
        }
    }

    /// Overrides the database column name.
    pub fn named(mut self, column_name: &str) -> Self {
        self.name = column_name.to_string();
        self
    }

    /// Marks the column as filled by the database (serial, identity, defaults).
    ///
    /// Generated columns holding null are left out of INSERT statements.
    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    pub fn property_name(&self) -> &str {
        &self.property_name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ColumnMode {
        self.mode
    }

    pub fn is_primary(&self) -> bool {
        self.mode == ColumnMode::Primary
    }

    pub fn is_parent_id(&self) -> bool {
        self.mode == ColumnMode::ParentId
    }

    pub fn is_generated(&self) -> bool {
        self.generated
    }
}

/// How a table is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Regular,
    /// Rows live in the parent's table, told apart by a discriminator column.
    SingleTableChild,
}

/// Table-level registration record.
///
/// A single-table child carries no name and no ordering of its own; both
/// are taken from the parent when the schema is built.
#[derive(Debug, Clone, PartialEq)]
pub struct TableMetadata {
    pub(crate) target: String,
    pub(crate) name: Option<String>,
    pub(crate) kind: TableKind,
    pub(crate) order_by: Vec<(String, Order)>,
}

impl TableMetadata {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    /// Default ordering, as (property or qualified column, direction) pairs.
    pub fn order_by(&self) -> &[(String, Order)] {
        &self.order_by
    }
}

/// Discriminator column and the value identifying one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct Discriminator {
    pub column: String,
    pub value: String,
}

/// Static description of an entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMetadata {
    pub(crate) table: TableMetadata,
    pub(crate) table_name: String,
    pub(crate) columns: Vec<ColumnMetadata>,
    pub(crate) discriminator: Option<Discriminator>,
}

impl EntityMetadata {
    pub fn target(&self) -> &str {
        self.table.target()
    }

    pub fn table(&self) -> &TableMetadata {
        &self.table
    }

    /// Physical table name (the parent's for single-table children).
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn columns(&self) -> &[ColumnMetadata] {
        &self.columns
    }

    pub fn discriminator(&self) -> Option<&Discriminator> {
        self.discriminator.as_ref()
    }

    /// Whether queries must filter rows by this entity's discriminator value.
    pub fn filters_by_discriminator(&self) -> bool {
        self.table.kind == TableKind::SingleTableChild
    }

    pub fn primary_columns(&self) -> impl Iterator<Item = &ColumnMetadata> {
        self.columns.iter().filter(|c| c.is_primary())
    }

    pub fn parent_id_columns(&self) -> impl Iterator<Item = &ColumnMetadata> {
        self.columns.iter().filter(|c| c.is_parent_id())
    }

    pub fn has_multiple_primary_keys(&self) -> bool {
        self.primary_columns().count() > 1
    }

    pub fn first_primary_column(&self) -> Option<&ColumnMetadata> {
        self.primary_columns().next()
    }

    pub fn first_parent_id_column(&self) -> Option<&ColumnMetadata> {
        self.parent_id_columns().next()
    }

    /// Columns identifying a row: the primary keys, or the parent-id
    /// columns when the entity declares no primary key.
    pub fn key_columns(&self) -> Vec<&ColumnMetadata> {
        let primary: Vec<_> = self.primary_columns().collect();
        if primary.is_empty() {
            self.parent_id_columns().collect()
        } else {
            primary
        }
    }

    pub fn column_by_property(&self, property_name: &str) -> Option<&ColumnMetadata> {
        self.columns
            .iter()
            .find(|c| c.property_name == property_name)
    }

    pub fn has_property(&self, property_name: &str) -> bool {
        self.column_by_property(property_name).is_some()
    }

    /// A blank record: every declared property set to null.
    pub fn create(&self) -> Record {
        self.columns
            .iter()
            .map(|c| (c.property_name.clone(), serde_json::Value::Null))
            .collect()
    }

    /// True iff every primary-key property holds a non-null, non-empty value.
    pub fn has_id(&self, record: &Record) -> bool {
        self.primary_columns()
            .all(|c| is_present(record.get(&c.property_name)))
    }

    /// Maps a result row (keyed by column name) to a record (keyed by property name).
    ///
    /// Columns missing from the row are left out of the record.
    pub fn record_from_row(&self, row: &Row) -> Record {
        self.columns
            .iter()
            .filter_map(|c| {
                row.get_raw(&c.name)
                    .map(|value| (c.property_name.clone(), value.clone()))
            })
            .collect()
    }

    /// Human-readable identity, e.g. `User(id=5)`, for error messages.
    pub fn describe_identity(&self, record: &Record) -> String {
        let keys: Vec<String> = self
            .primary_columns()
            .chain(self.parent_id_columns())
            .map(|c| {
                let value = record
                    .get(&c.property_name)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "?".to_string());
                format!("{}={}", c.property_name, value)
            })
            .collect();
        format!("{}({})", self.target(), keys.join(", "))
    }
}
