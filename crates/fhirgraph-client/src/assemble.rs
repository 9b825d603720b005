//! Final response assembly.
//!
//! After a traversal completes, the cached bundle entries are merged into
//! the caller-facing shape: a single `collection` bundle (optionally
//! flattened to a resource list) or a map of resources keyed by type.
//! Entries are deduplicated by `resourceType/id`, entries without an id by
//! their request URL. Per-request errors can be materialized as
//! `OperationOutcome` resources carrying the request context.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde_json::{Value, json};

use fhirgraph_core::{Bundle, BundleEntry, BundleEntryRequest, resource_type_of};

use crate::config::GraphOptions;
use crate::response::ResponseHeader;

const CODING_URL: &str = "https://fhirgraph.dev/url";
const CODING_RESOURCE_TYPE: &str = "https://fhirgraph.dev/resourceType";
const CODING_ID: &str = "https://fhirgraph.dev/id";
const CODING_STATUS: &str = "https://fhirgraph.dev/statuscode";
const CODING_ACCESS_TOKEN: &str = "https://fhirgraph.dev/accessToken";
const CODING_REQUEST_ID: &str = "https://fhirgraph.dev/requestId";

/// The assembled output of one traversal.
#[derive(Debug, Clone)]
pub enum GraphOutput {
    /// `expand_fhir_bundle = false`: the collection bundle itself.
    Bundle(Bundle),
    /// Default: the flattened resource list.
    Resources(Vec<Value>),
    /// `separate_bundle_resources = true`: resources keyed by type, fetch
    /// order within each list.
    ByType(IndexMap<String, Vec<Value>>),
}

impl GraphOutput {
    /// Every resource in the output, whatever the shape.
    pub fn resources(&self) -> Vec<&Value> {
        match self {
            Self::Bundle(bundle) => bundle.resources(),
            Self::Resources(resources) => resources.iter().collect(),
            Self::ByType(map) => map.values().flatten().collect(),
        }
    }

    pub fn resource_count(&self) -> usize {
        self.resources().len()
    }
}

/// Merge fetched entries (plus synthesized error outcomes) into the final
/// output shape.
pub fn assemble(
    mut entries: Vec<BundleEntry>,
    errors: &[ResponseHeader],
    options: &GraphOptions,
) -> GraphOutput {
    if options.create_operation_outcome_for_error {
        for header in errors {
            entries.push(BundleEntry::new(
                operation_outcome(header),
                (!header.url.is_empty()).then(|| BundleEntryRequest::get(header.url.clone())),
                None,
            ));
        }
    }

    let mut entries = dedupe_entries(entries);
    if options.sort_resources {
        entries.sort_by_key(sort_key);
    }

    if options.separate_bundle_resources {
        let mut by_type: IndexMap<String, Vec<Value>> = IndexMap::new();
        for entry in entries {
            if let Some(resource) = entry.resource {
                let key = resource_type_of(&resource)
                    .unwrap_or("Resource")
                    .to_string();
                by_type.entry(key).or_default().push(resource);
            }
        }
        return GraphOutput::ByType(by_type);
    }

    let mut bundle = Bundle::collection(entries);
    bundle.total = Some(bundle.entry.len() as u64);

    if options.expand_fhir_bundle {
        GraphOutput::Resources(
            bundle
                .entry
                .into_iter()
                .filter_map(|e| e.resource)
                .collect(),
        )
    } else {
        GraphOutput::Bundle(bundle)
    }
}

/// Keep the first entry per dedupe key; entries with no key are kept as-is.
fn dedupe_entries(entries: Vec<BundleEntry>) -> Vec<BundleEntry> {
    let mut seen: HashSet<String> = HashSet::new();
    entries
        .into_iter()
        .filter(|entry| match entry.dedupe_key() {
            Some(key) => seen.insert(key),
            None => true,
        })
        .collect()
}

/// Sort key: resource type group, real resources before synthetic outcomes,
/// then id. An OperationOutcome sorts inside the group of the type whose
/// fetch failed.
fn sort_key(entry: &BundleEntry) -> (String, u8, String) {
    let id = entry.resource_id().unwrap_or_default().to_string();
    match entry.resource_type() {
        Some("OperationOutcome") => {
            let group = entry
                .resource
                .as_ref()
                .and_then(outcome_origin_type)
                .unwrap_or_else(|| "OperationOutcome".to_string());
            (group, 1, id)
        }
        Some(resource_type) => (resource_type.to_string(), 0, id),
        None => (String::new(), 0, id),
    }
}

/// The originating resource type recorded in an outcome's details coding.
fn outcome_origin_type(outcome: &Value) -> Option<String> {
    outcome
        .get("issue")?
        .as_array()?
        .first()?
        .get("details")?
        .get("coding")?
        .as_array()?
        .iter()
        .find(|c| c.get("system").and_then(Value::as_str) == Some(CODING_RESOURCE_TYPE))
        .and_then(|c| c.get("code").and_then(Value::as_str))
        .map(str::to_string)
}

/// Build an OperationOutcome resource for a failed request.
pub fn operation_outcome(header: &ResponseHeader) -> Value {
    let issue_code = match header.status {
        401 => "expired",
        404 => "not-found",
        _ => "exception",
    };

    let mut coding = Vec::new();
    if !header.url.is_empty() {
        coding.push(json!({"system": CODING_URL, "code": header.url}));
    }
    if !header.resource_type.is_empty() {
        coding.push(json!({"system": CODING_RESOURCE_TYPE, "code": header.resource_type}));
    }
    if !header.ids.is_empty() {
        coding.push(json!({"system": CODING_ID, "code": header.ids.join(",")}));
    }
    coding.push(json!({"system": CODING_STATUS, "code": header.status}));
    if let Some(token) = &header.access_token {
        coding.push(json!({"system": CODING_ACCESS_TOKEN, "code": token}));
    }
    if let Some(request_id) = &header.request_id {
        coding.push(json!({"system": CODING_REQUEST_ID, "code": request_id.to_string()}));
    }

    let diagnostics = json!({
        "url": header.url,
        "error": header.error,
        "status": header.status,
        "accessToken": header.access_token,
        "requestId": header.request_id.map(|id| id.to_string()),
        "resourceType": header.resource_type,
        "id": header.ids,
    })
    .to_string();

    json!({
        "resourceType": "OperationOutcome",
        "issue": [{
            "severity": "error",
            "code": issue_code,
            "details": {"coding": coding},
            "diagnostics": diagnostics,
        }]
    })
}
