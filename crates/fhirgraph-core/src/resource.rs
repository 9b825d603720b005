//! Accessors for opaque FHIR resources.
//!
//! The client treats resources as data: only `resourceType`, `id` and the
//! paths named in a graph definition are ever read.

use serde_json::Value;

/// Returns the `resourceType` of a resource, if present.
pub fn resource_type_of(resource: &Value) -> Option<&str> {
    resource.get("resourceType").and_then(Value::as_str)
}

/// Returns the `id` of a resource, if present.
pub fn resource_id_of(resource: &Value) -> Option<&str> {
    resource.get("id").and_then(Value::as_str)
}

/// True when the value is a FHIR Bundle resource.
pub fn is_bundle(resource: &Value) -> bool {
    resource_type_of(resource) == Some("Bundle")
}

/// The `Type/id` key used for caching and deduplication.
pub fn resource_key(resource: &Value) -> Option<String> {
    match (resource_type_of(resource), resource_id_of(resource)) {
        (Some(t), Some(id)) => Some(format!("{t}/{id}")),
        _ => None,
    }
}
