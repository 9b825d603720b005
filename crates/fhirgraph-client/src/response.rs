//! Fetch results.
//!
//! Every resolved HTTP request (and every streamed NDJSON chunk) is emitted
//! to the caller as one [`FetchResult`]: a shared header plus a tagged
//! payload. The payload variant is picked by [`FetchResult::from_body`] from
//! the decoded JSON; downstream code matches on the tag instead of
//! re-inspecting the body.

use indexmap::IndexMap;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use fhirgraph_core::{
    Bundle, BundleEntry, BundleEntryRequest, BundleEntryResponse, is_bundle, resource_key,
};

/// One network attempt, retries included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub url: String,
    pub status: u16,
    pub retry_count: u32,
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    pub ok: bool,
}

/// Metadata shared by every payload variant.
#[derive(Debug, Clone)]
pub struct ResponseHeader {
    pub request_id: Option<Uuid>,
    /// The request URL this result answers. Empty for synthetic results
    /// (scope denials).
    pub url: String,
    pub resource_type: String,
    /// The ids this request asked for; empty for query-style requests.
    pub ids: Vec<String>,
    pub status: u16,
    /// The bearer token in force when the response arrived; rotated by a
    /// mid-request refresh.
    pub access_token: Option<String>,
    /// Cache hits folded into this result (synthetic cache emissions only).
    pub cache_hits: usize,
    /// Monotonically increasing chunk number for streamed NDJSON responses.
    pub chunk_number: Option<u32>,
    /// One record per network attempt, including failed retries.
    pub results_by_url: Vec<AttemptRecord>,
    pub error: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<OffsetDateTime>,
}

impl ResponseHeader {
    pub fn new(url: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            request_id: Some(Uuid::new_v4()),
            url: url.into(),
            resource_type: resource_type.into(),
            ids: Vec::new(),
            status: 0,
            access_token: None,
            cache_hits: 0,
            chunk_number: None,
            results_by_url: Vec::new(),
            error: None,
            etag: None,
            last_modified: None,
        }
    }

    pub fn with_ids(mut self, ids: Vec<String>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

/// The decoded body of a fetch, by shape.
#[derive(Debug, Clone)]
pub enum FetchPayload {
    /// The server answered with a Bundle; entry order is preserved.
    Bundle(Bundle),
    /// A list of bare resources (NDJSON chunks, cache emissions).
    List(Vec<Value>),
    /// A single resource.
    Single(Value),
    /// Resources grouped by type (assembled separated-mode output).
    ByType(IndexMap<String, Vec<Value>>),
    /// A failed request; the raw body is kept for diagnostics.
    Error { body: Option<String> },
}

/// One emitted unit of a traversal.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub header: ResponseHeader,
    pub payload: FetchPayload,
}

impl FetchResult {
    /// Pick the payload variant from a raw response body.
    ///
    /// Non-2xx statuses and undecodable bodies produce the `Error` variant;
    /// an empty 2xx body is an empty list.
    pub fn from_body(mut header: ResponseHeader, body: &str) -> Self {
        if header.error.is_some() || !(200..300).contains(&header.status) {
            return Self {
                header,
                payload: FetchPayload::Error {
                    body: (!body.is_empty()).then(|| body.to_string()),
                },
            };
        }
        if body.is_empty() {
            return Self {
                header,
                payload: FetchPayload::List(Vec::new()),
            };
        }
        match serde_json::from_str::<Value>(body) {
            Ok(value) => Self::from_json(header, value),
            Err(e) => {
                header.error = Some(format!("Error parsing response: {e}"));
                Self {
                    header,
                    payload: FetchPayload::Error {
                        body: Some(body.to_string()),
                    },
                }
            }
        }
    }

    /// Pick the payload variant from already-decoded JSON.
    pub fn from_json(mut header: ResponseHeader, value: Value) -> Self {
        let payload = match value {
            Value::Array(items) => FetchPayload::List(items),
            Value::Object(_) if is_bundle(&value) => {
                match serde_json::from_value::<Bundle>(value) {
                    Ok(bundle) => FetchPayload::Bundle(bundle),
                    Err(e) => {
                        header.error = Some(format!("Error parsing bundle: {e}"));
                        FetchPayload::Error { body: None }
                    }
                }
            }
            Value::Object(_) => FetchPayload::Single(value),
            other => {
                header.error = Some(format!("Unexpected response shape: {other}"));
                FetchPayload::Error { body: None }
            }
        };
        Self { header, payload }
    }

    /// A synthetic success for a scope-denied resource type: no request was
    /// made, nothing is returned.
    pub fn scope_denied(resource_type: impl Into<String>, ids: Vec<String>) -> Self {
        Self {
            header: ResponseHeader {
                request_id: None,
                url: String::new(),
                resource_type: resource_type.into(),
                ids,
                status: 200,
                access_token: None,
                cache_hits: 0,
                chunk_number: None,
                results_by_url: Vec::new(),
                error: None,
                etag: None,
                last_modified: None,
            },
            payload: FetchPayload::List(Vec::new()),
        }
    }

    /// A synthetic result replaying cached entries without a request.
    pub fn from_cache(resource_type: impl Into<String>, entries: Vec<BundleEntry>) -> Self {
        let url = entries
            .first()
            .and_then(|e| e.request.as_ref())
            .map(|r| r.url.clone())
            .unwrap_or_default();
        let cache_hits = entries.len();
        Self {
            header: ResponseHeader {
                request_id: None,
                url,
                resource_type: resource_type.into(),
                ids: entries
                    .iter()
                    .filter_map(|e| e.resource_id().map(str::to_string))
                    .collect(),
                status: 200,
                access_token: None,
                cache_hits,
                chunk_number: None,
                results_by_url: Vec::new(),
                error: None,
                etag: None,
                last_modified: None,
            },
            payload: FetchPayload::Bundle(Bundle::collection(entries)),
        }
    }

    /// True when this result carries a per-request error.
    pub fn is_error(&self) -> bool {
        self.header.error.is_some() || matches!(self.payload, FetchPayload::Error { .. })
    }

    /// The resources carried by this result, in response order.
    pub fn resources(&self) -> Vec<&Value> {
        match &self.payload {
            FetchPayload::Bundle(bundle) => bundle.resources(),
            FetchPayload::List(items) => items.iter().collect(),
            FetchPayload::Single(resource) => vec![resource],
            FetchPayload::ByType(map) => map.values().flatten().collect(),
            FetchPayload::Error { .. } => Vec::new(),
        }
    }

    /// The resources wrapped as bundle entries with this result's
    /// request/response metadata. Server entry order is preserved.
    pub fn bundle_entries(&self) -> Vec<BundleEntry> {
        let request = (!self.header.url.is_empty())
            .then(|| BundleEntryRequest::get(self.header.url.clone()));
        let response = BundleEntryResponse::from_status(self.header.status)
            .with_etag(self.header.etag.clone())
            .with_last_modified(self.header.last_modified);
        match &self.payload {
            FetchPayload::Bundle(bundle) => bundle
                .entry
                .iter()
                .map(|e| {
                    let mut entry = e.clone();
                    if entry.request.is_none() {
                        entry.request = request.clone();
                    }
                    if entry.response.is_none() {
                        entry.response = Some(response.clone());
                    }
                    entry
                })
                .collect(),
            FetchPayload::Error { .. } => Vec::new(),
            _ => self
                .resources()
                .into_iter()
                .map(|r| BundleEntry::new(r.clone(), request.clone(), Some(response.clone())))
                .collect(),
        }
    }

    /// `Type/id` labels of the carried resources, for logging.
    pub fn resource_type_and_ids(&self) -> Vec<String> {
        self.resources().into_iter().filter_map(resource_key).collect()
    }
}
