//! Entity trait and the record view used at the persistence seam.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::error::AppError;

/// A property-name → value view of one entity.
///
/// Repositories convert entities to records before handing them to the
/// query builder and persister, and back again afterwards.
pub type Record = serde_json::Map<String, JsonValue>;

/// A Rust type mapped to a table.
///
/// The type must serialize to a JSON object whose keys are the property
/// names registered in the [`Schema`](crate::schema::Schema).
/// `Default` provides the blank instance that `create` and `merge` start from.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Default, Serialize, Deserialize)]
/// struct User {
///     id: Option<i64>,
///     name: String,
/// }
///
/// impl Entity for User {
///     const TARGET: &'static str = "User";
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Default + Send + Sync + 'static {
    /// Identity under which this type is registered in the schema.
    const TARGET: &'static str;
}

/// Serializes an entity into its record view.
pub(crate) fn to_record<E: Entity>(entity: &E) -> Result<Record, AppError> {
    match serde_json::to_value(entity)? {
        JsonValue::Object(record) => Ok(record),
        other => Err(AppError::Validation(format!(
            "{} must serialize to an object, got {}",
            E::TARGET,
            other
        ))),
    }
}

/// Deserializes a record back into an entity.
pub(crate) fn from_record<E: Entity>(record: Record) -> Result<E, AppError> {
    Ok(serde_json::from_value(JsonValue::Object(record))?)
}

/// Returns true if a key value counts as present: not null and not an empty string.
pub(crate) fn is_present(value: Option<&JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) => false,
        Some(JsonValue::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}
