//! Explicit entity registration, resolved into an immutable [`Schema`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::entity::Entity;
use crate::error::AppError;
use crate::query::{validate_identifier, Order};
use crate::schema::metadata::{ColumnMetadata, Discriminator, EntityMetadata, TableKind, TableMetadata};
use crate::schema::Schema;

/// Registration of one entity type.
#[derive(Debug, Clone)]
pub struct EntityDefinition {
    table: TableMetadata,
    columns: Vec<ColumnMetadata>,
    parent: Option<String>,
    discriminator_column: Option<String>,
    discriminator_value: Option<String>,
}

impl EntityDefinition {
    /// An entity stored in its own table.
    pub fn table<E: Entity>(name: &str) -> Self {
        Self {
            table: TableMetadata {
                target: E::TARGET.to_string(),
                name: Some(name.to_string()),
                kind: TableKind::Regular,
                order_by: Vec::new(),
            },
            columns: Vec::new(),
            parent: None,
            discriminator_column: None,
            discriminator_value: None,
        }
    }

    /// An entity whose rows live in the table of `P`.
    ///
    /// Registers a table record of kind single-table-child with no name or
    /// ordering of its own. The parent must declare a discriminator column.
    pub fn single_table_child<E: Entity, P: Entity>() -> Self {
        Self {
            table: TableMetadata {
                target: E::TARGET.to_string(),
                name: None,
                kind: TableKind::SingleTableChild,
                order_by: Vec::new(),
            },
            columns: Vec::new(),
            parent: Some(P::TARGET.to_string()),
            discriminator_column: None,
            discriminator_value: None,
        }
    }

    pub fn column(mut self, column: ColumnMetadata) -> Self {
        self.columns.push(column);
        self
    }

    /// Default ordering applied when a find does not specify one.
    pub fn order_by(mut self, property: &str, order: Order) -> Self {
        self.table.order_by.push((property.to_string(), order));
        self
    }

    /// Column telling apart the entity types sharing this table.
    pub fn discriminator_column(mut self, column: &str) -> Self {
        self.discriminator_column = Some(column.to_string());
        self
    }

    /// Value written to the discriminator column; defaults to the target name.
    pub fn discriminator_value(mut self, value: &str) -> Self {
        self.discriminator_value = Some(value.to_string());
        self
    }

    fn target(&self) -> &str {
        &self.table.target
    }

    fn discriminator(&self, column: Option<&str>) -> Option<Discriminator> {
        column.map(|column| Discriminator {
            column: column.to_string(),
            value: self
                .discriminator_value
                .clone()
                .unwrap_or_else(|| self.table.target.clone()),
        })
    }
}

/// Collects entity definitions at startup.
///
/// # Example
///
/// ```ignore
/// let schema = Schema::builder()
///     .entity(
///         EntityDefinition::table::<Person>("people")
///             .column(ColumnMetadata::primary("id").generated())
///             .column(ColumnMetadata::new("name"))
///             .discriminator_column("kind"),
///     )
///     .entity(
///         EntityDefinition::single_table_child::<Employee, Person>()
///             .column(ColumnMetadata::new("salary")),
///     )
///     .build()?;
/// ```
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    definitions: Vec<EntityDefinition>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, definition: EntityDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Resolves every definition into [`EntityMetadata`].
    ///
    /// Single-table children inherit the parent's table name, ordering and
    /// columns, and get the parent's discriminator column with their own value.
    pub fn build(self) -> Result<Arc<Schema>, AppError> {
        let mut seen = HashSet::new();
        for definition in &self.definitions {
            if !seen.insert(definition.target()) {
                return Err(AppError::Schema(format!(
                    "entity {} registered twice",
                    definition.target()
                )));
            }
        }

        let parents: HashMap<&str, &EntityDefinition> = self
            .definitions
            .iter()
            .filter(|d| d.table.kind == TableKind::Regular)
            .map(|d| (d.target(), d))
            .collect();

        let mut entities = HashMap::new();
        for definition in &self.definitions {
            let metadata = match definition.table.kind {
                TableKind::Regular => resolve_table(definition)?,
                TableKind::SingleTableChild => resolve_child(definition, &parents)?,
            };
            validate_metadata(&metadata)?;
            tracing::debug!(
                target_entity = metadata.target(),
                table = metadata.table_name(),
                "entity registered"
            );
            entities.insert(metadata.target().to_string(), Arc::new(metadata));
        }

        Ok(Arc::new(Schema { entities }))
    }
}

fn resolve_table(definition: &EntityDefinition) -> Result<EntityMetadata, AppError> {
    let table_name = definition.table.name.clone().ok_or_else(|| {
        AppError::Schema(format!("entity {} has no table name", definition.target()))
    })?;

    Ok(EntityMetadata {
        table: definition.table.clone(),
        table_name,
        columns: definition.columns.clone(),
        discriminator: definition.discriminator(definition.discriminator_column.as_deref()),
    })
}

fn resolve_child(
    definition: &EntityDefinition,
    parents: &HashMap<&str, &EntityDefinition>,
) -> Result<EntityMetadata, AppError> {
    let target = definition.target();
    let parent_target = definition.parent.as_deref().unwrap_or_default();
    let parent = parents.get(parent_target).ok_or_else(|| {
        AppError::Schema(format!(
            "single-table child {} extends unknown table entity {}",
            target, parent_target
        ))
    })?;

    if !definition.table.order_by.is_empty() {
        return Err(AppError::Schema(format!(
            "single-table child {} cannot declare its own ordering",
            target
        )));
    }
    if definition.discriminator_column.is_some() {
        return Err(AppError::Schema(format!(
            "single-table child {} uses the discriminator column of {}",
            target, parent_target
        )));
    }
    let column = parent.discriminator_column.as_deref().ok_or_else(|| {
        AppError::Schema(format!(
            "{} has single-table children but no discriminator column",
            parent_target
        ))
    })?;

    let parent_metadata = resolve_table(parent)?;
    let mut columns = parent_metadata.columns.clone();
    columns.extend(definition.columns.iter().cloned());

    Ok(EntityMetadata {
        table: TableMetadata {
            order_by: parent_metadata.table.order_by.clone(),
            ..definition.table.clone()
        },
        table_name: parent_metadata.table_name,
        columns,
        discriminator: definition.discriminator(Some(column)),
    })
}

fn validate_metadata(metadata: &EntityMetadata) -> Result<(), AppError> {
    let target = metadata.target();
    validate_identifier(metadata.table_name())?;

    if metadata.first_primary_column().is_none() && metadata.first_parent_id_column().is_none() {
        return Err(AppError::Schema(format!(
            "entity {} declares no primary or parent id column",
            target
        )));
    }

    let mut properties = HashSet::new();
    let mut names = HashSet::new();
    for column in metadata.columns() {
        validate_identifier(column.name())?;
        if !properties.insert(column.property_name()) || !names.insert(column.name()) {
            return Err(AppError::Schema(format!(
                "entity {} maps property {} (column {}) more than once",
                target,
                column.property_name(),
                column.name()
            )));
        }
    }

    for (sort, _) in metadata.table().order_by() {
        validate_identifier(sort)?;
    }

    if let Some(discriminator) = metadata.discriminator() {
        validate_identifier(&discriminator.column)?;
        if names.contains(discriminator.column.as_str()) {
            return Err(AppError::Schema(format!(
                "discriminator column {} of {} is also mapped to a property",
                discriminator.column, target
            )));
        }
    }

    Ok(())
}
