//! Entity schema: what each entity type maps to.
//!
//! Entities are registered explicitly through [`SchemaBuilder`] at startup
//! and resolved into an immutable [`Schema`], which is then passed to the
//! [`Connection`](crate::connection::Connection). There is no global registry.

mod builder;
mod metadata;

use std::collections::HashMap;
use std::sync::Arc;

pub use builder::{EntityDefinition, SchemaBuilder};
pub use metadata::{
    ColumnMetadata, ColumnMode, Discriminator, EntityMetadata, TableKind, TableMetadata,
};

use crate::entity::Entity;
use crate::error::AppError;

/// Immutable set of resolved entity metadata, keyed by target.
#[derive(Debug, Default)]
pub struct Schema {
    entities: HashMap<String, Arc<EntityMetadata>>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    /// Looks up metadata by target name.
    pub fn metadata(&self, target: &str) -> Result<Arc<EntityMetadata>, AppError> {
        self.entities
            .get(target)
            .cloned()
            .ok_or_else(|| AppError::EntityNotRegistered(target.to_string()))
    }

    /// Looks up metadata for an entity type.
    pub fn metadata_for<E: Entity>(&self) -> Result<Arc<EntityMetadata>, AppError> {
        self.metadata(E::TARGET)
    }

    /// Registered target names.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(|s| s.as_str())
    }
}
