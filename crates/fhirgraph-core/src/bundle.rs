//! FHIR Bundle wire types.
//!
//! Every resource the client fetches is wrapped in a [`BundleEntry`] carrying
//! the originating request and response metadata before it is cached or
//! emitted, and the assembled output of a graph traversal is a `Bundle` of
//! type `collection`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::resource::{resource_id_of, resource_key, resource_type_of};

/// The request half of a bundle entry: where the resource came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleEntryRequest {
    pub method: String,
    pub url: String,
}

impl BundleEntryRequest {
    /// A GET request for the given URL.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
        }
    }
}

/// The response half of a bundle entry: status and caching metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleEntryResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(
        rename = "lastModified",
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub last_modified: Option<OffsetDateTime>,
}

impl BundleEntryResponse {
    pub fn from_status(status: u16) -> Self {
        Self {
            status: status.to_string(),
            etag: None,
            last_modified: None,
        }
    }

    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    pub fn with_last_modified(mut self, last_modified: Option<OffsetDateTime>) -> Self {
        self.last_modified = last_modified;
        self
    }
}

/// One entry of a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BundleEntry {
    #[serde(rename = "fullUrl", skip_serializing_if = "Option::is_none")]
    pub full_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<BundleEntryRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<BundleEntryResponse>,
}

impl BundleEntry {
    /// Wrap a fetched resource together with its request/response metadata.
    pub fn new(
        resource: Value,
        request: Option<BundleEntryRequest>,
        response: Option<BundleEntryResponse>,
    ) -> Self {
        Self {
            full_url: None,
            resource: Some(resource),
            request,
            response,
        }
    }

    /// The `resourceType` of the wrapped resource, if any.
    pub fn resource_type(&self) -> Option<&str> {
        self.resource.as_ref().and_then(resource_type_of)
    }

    /// The `id` of the wrapped resource, if any.
    pub fn resource_id(&self) -> Option<&str> {
        self.resource.as_ref().and_then(resource_id_of)
    }

    /// The `Type/id` dedupe key; entries without an id fall back to the
    /// request URL.
    pub fn dedupe_key(&self) -> Option<String> {
        self.resource
            .as_ref()
            .and_then(resource_key)
            .or_else(|| self.request.as_ref().map(|r| r.url.clone()))
    }
}

/// A FHIR Bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    #[serde(rename = "type")]
    pub bundle_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub entry: Vec<BundleEntry>,
}

impl Bundle {
    /// An empty bundle of the given type (`collection`, `searchset`, ...).
    pub fn new(bundle_type: impl Into<String>) -> Self {
        Self {
            resource_type: "Bundle".to_string(),
            bundle_type: bundle_type.into(),
            total: None,
            entry: Vec::new(),
        }
    }

    /// A `collection` bundle holding the given entries.
    pub fn collection(entry: Vec<BundleEntry>) -> Self {
        Self {
            resource_type: "Bundle".to_string(),
            bundle_type: "collection".to_string(),
            total: None,
            entry,
        }
    }

    /// The inner resources, in entry order.
    pub fn resources(&self) -> Vec<&Value> {
        self.entry.iter().filter_map(|e| e.resource.as_ref()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_wire_format() {
        let entry = BundleEntry::new(
            json!({"resourceType": "Patient", "id": "1"}),
            Some(BundleEntryRequest::get("http://fhir.example.com/Patient/1")),
            Some(BundleEntryResponse::from_status(200)),
        );
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["resource"]["resourceType"], "Patient");
        assert_eq!(value["request"]["method"], "GET");
        assert_eq!(value["response"]["status"], "200");
        assert!(value.get("fullUrl").is_none());
    }

    #[test]
    fn test_entry_deserialization_camel_case() {
        let entry: BundleEntry = serde_json::from_value(json!({
            "fullUrl": "http://fhir.example.com/Patient/1",
            "resource": {"resourceType": "Patient", "id": "1"},
            "response": {"status": "200", "lastModified": "2023-05-15T14:30:00Z"}
        }))
        .unwrap();
        assert_eq!(
            entry.full_url.as_deref(),
            Some("http://fhir.example.com/Patient/1")
        );
        assert!(entry.response.unwrap().last_modified.is_some());
    }

    #[test]
    fn test_dedupe_key() {
        let keyed = BundleEntry::new(
            json!({"resourceType": "Patient", "id": "1"}),
            None,
            None,
        );
        assert_eq!(keyed.dedupe_key(), Some("Patient/1".to_string()));

        // no id: fall back to the request url
        let unkeyed = BundleEntry::new(
            json!({"resourceType": "Bundle"}),
            Some(BundleEntryRequest::get("http://fhir.example.com/Patient?_id=1,2")),
            None,
        );
        assert_eq!(
            unkeyed.dedupe_key(),
            Some("http://fhir.example.com/Patient?_id=1,2".to_string())
        );

        assert_eq!(BundleEntry::default().dedupe_key(), None);
    }

    #[test]
    fn test_bundle_roundtrip() {
        let bundle = Bundle::collection(vec![BundleEntry::new(
            json!({"resourceType": "Patient", "id": "1"}),
            None,
            None,
        )]);
        let value = serde_json::to_value(&bundle).unwrap();
        assert_eq!(value["resourceType"], "Bundle");
        assert_eq!(value["type"], "collection");

        let parsed: Bundle = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.entry.len(), 1);
        assert_eq!(parsed.resources()[0]["id"], "1");
    }

    #[test]
    fn test_empty_entry_not_serialized() {
        let bundle = Bundle::new("collection");
        let value = serde_json::to_value(&bundle).unwrap();
        assert!(value.get("entry").is_none());
        assert!(value.get("total").is_none());
    }
}
