//! The entity contract the generic repository is parameterized over

use std::fmt;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use super::error::{RepositoryError, RepositoryOperation};
use crate::store::Record;

/// A persisted record type with a unique identity field
///
/// Entities move to and from the store as JSON records, so the entity and its
/// input types only need serde derives. `Create` is the partial input used by
/// `create` (generated columns omitted); `Update` is the typed partial update,
/// where fields set to `None` should be skipped during serialization.
///
/// # Example
///
/// ```rust
/// use acton_dal::repository::Entity;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct User {
///     id: String,
///     email: String,
///     #[serde(default)]
///     is_deleted: bool,
/// }
///
/// #[derive(Serialize)]
/// struct NewUser {
///     email: String,
/// }
///
/// #[derive(Default, Serialize)]
/// struct UserPatch {
///     #[serde(skip_serializing_if = "Option::is_none")]
///     email: Option<String>,
/// }
///
/// impl Entity for User {
///     const TABLE: &'static str = "users";
///     type Id = String;
///     type Create = NewUser;
///     type Update = UserPatch;
///
///     fn id(&self) -> &String {
///         &self.id
///     }
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Table (or collection) holding the entity
    const TABLE: &'static str;

    /// Name of the identity column
    const ID_FIELD: &'static str = "id";

    /// Identity type
    type Id: Serialize + fmt::Display + Send + Sync;

    /// Partial input accepted by `create`
    type Create: Serialize + Send + Sync;

    /// Typed partial update accepted by `update`
    type Update: Serialize + Send + Sync;

    /// The entity's identity
    fn id(&self) -> &Self::Id;
}

/// Serialize a value into a record; anything that is not a JSON object is rejected
pub(crate) fn to_record<V: Serialize>(
    operation: RepositoryOperation,
    value: &V,
) -> Result<Record, RepositoryError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(RepositoryError::serialization_error(
            operation,
            format!("expected an object, got {}", json_kind(&other)),
        )),
        Err(e) => Err(RepositoryError::serialization_error(operation, e.to_string())),
    }
}

/// Deserialize a store record into an entity
pub(crate) fn from_record<T: DeserializeOwned>(
    operation: RepositoryOperation,
    record: Record,
) -> Result<T, RepositoryError> {
    serde_json::from_value(Value::Object(record))
        .map_err(|e| RepositoryError::serialization_error(operation, e.to_string()))
}

/// Serialize an identity for use in a filter
pub(crate) fn id_value<I: Serialize>(
    operation: RepositoryOperation,
    id: &I,
) -> Result<Value, RepositoryError> {
    serde_json::to_value(id).map_err(|e| RepositoryError::serialization_error(operation, e.to_string()))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
