//! The HTTP fetch engine.
//!
//! One call, one shaped request, one or more [`FetchResult`]s: the engine
//! attaches the bearer token, retries transient failures with backoff,
//! refreshes the token once on 401/403 through the caller's callback, and
//! decodes the body either whole or as streamed NDJSON chunks. Every network
//! attempt, including failed retries, is recorded on the emitted result.
//!
//! Errors never cross this boundary: a request that ultimately fails is
//! returned as a `FetchResult` with `error` set so sibling traversal paths
//! keep going.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, ETAG, LAST_MODIFIED, RETRY_AFTER};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc2822;
use url::Url;
use uuid::Uuid;

use fhirgraph_auth::{RefreshContext, RefreshTokenCallback, SharedToken};

use crate::response::{AttemptRecord, FetchPayload, FetchResult, ResponseHeader};
use crate::retry::{RetryPolicy, parse_retry_after};

const ACCEPT_FHIR_JSON: &str = "application/fhir+json,application/json+fhir";
const ACCEPT_FHIR_NDJSON: &str = "application/fhir+ndjson";

/// Callback invoked with each raw NDJSON chunk. Returning `false` stops
/// consumption of the response stream.
pub type StreamingChunkHandler = Arc<dyn Fn(&[u8], u32) -> bool + Send + Sync>;

/// One shaped request to the server.
#[derive(Clone, Default)]
pub struct PageRequest {
    pub resource_type: String,
    /// Instance ids to fetch. One id becomes `/Type/id`, several become
    /// `?_id=a,b,c`, none leaves a query-only request.
    pub ids: Vec<String>,
    /// Already-formed `k=v` pairs appended to the query string.
    pub parameters: Vec<String>,
    pub page_number: Option<u32>,
    pub page_size: Option<u32>,
    /// Cursor for id-based pagination.
    pub id_above: Option<String>,
    pub streaming_handler: Option<StreamingChunkHandler>,
}

impl PageRequest {
    /// A request for specific instance ids.
    pub fn by_ids(resource_type: impl Into<String>, ids: Vec<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            ids,
            ..Self::default()
        }
    }

    /// A query-style request (reverse links).
    pub fn by_query(resource_type: impl Into<String>, parameters: Vec<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            parameters,
            ..Self::default()
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<String>) -> Self {
        self.parameters = parameters;
        self
    }
}

impl fmt::Debug for PageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageRequest")
            .field("resource_type", &self.resource_type)
            .field("ids", &self.ids)
            .field("parameters", &self.parameters)
            .field("page_number", &self.page_number)
            .field("page_size", &self.page_size)
            .field("id_above", &self.id_above)
            .field("streaming", &self.streaming_handler.is_some())
            .finish()
    }
}

/// The narrow seam between the walker and the network.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Resolve one shaped request into its results: one per id chunk is the
    /// caller's job, one per NDJSON chunk is this method's.
    async fn fetch_page(&self, request: PageRequest) -> Vec<FetchResult>;
}

/// Production [`PageFetcher`] over reqwest.
pub struct FetchEngine {
    http: reqwest::Client,
    base_url: Url,
    token: SharedToken,
    refresh: Option<RefreshTokenCallback>,
    retry: RetryPolicy,
    use_data_streaming: bool,
}

impl FetchEngine {
    pub fn new(
        http: reqwest::Client,
        base_url: Url,
        token: SharedToken,
        refresh: Option<RefreshTokenCallback>,
        retry: RetryPolicy,
        use_data_streaming: bool,
    ) -> Self {
        Self {
            http,
            base_url,
            token,
            refresh,
            retry,
            use_data_streaming,
        }
    }

    fn build_url(&self, request: &PageRequest) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        let mut url = format!("{base}/{}", request.resource_type);
        if request.ids.len() == 1 {
            url.push('/');
            url.push_str(&request.ids[0]);
        }
        let mut query: Vec<String> = Vec::new();
        if request.ids.len() > 1 {
            query.push(format!("_id={}", request.ids.join(",")));
        }
        query.extend(request.parameters.iter().cloned());
        if let (Some(page_size), Some(page_number)) = (request.page_size, request.page_number) {
            query.push(format!("_count={page_size}"));
            query.push(format!("_getpagesoffset={page_number}"));
        }
        if let Some(id_above) = &request.id_above {
            query.push(format!("id:above={id_above}"));
        }
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query.join("&"));
        }
        url
    }

    fn header_for(
        &self,
        request: &PageRequest,
        request_id: Uuid,
        url: &str,
        status: u16,
        access_token: Option<String>,
        attempts: Vec<AttemptRecord>,
    ) -> ResponseHeader {
        ResponseHeader {
            request_id: Some(request_id),
            url: url.to_string(),
            resource_type: request.resource_type.clone(),
            ids: request.ids.clone(),
            status,
            access_token,
            cache_hits: 0,
            chunk_number: None,
            results_by_url: attempts,
            error: None,
            etag: None,
            last_modified: None,
        }
    }

    async fn consume_ndjson(
        &self,
        response: reqwest::Response,
        request: &PageRequest,
        request_id: Uuid,
        url: &str,
        attempts: Vec<AttemptRecord>,
        access_token: Option<String>,
    ) -> Vec<FetchResult> {
        let status = response.status().as_u16();
        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut chunk_number: u32 = 0;
        let mut results: Vec<FetchResult> = Vec::new();

        let emit = |resources: Vec<Value>, chunk_number: u32, results: &mut Vec<FetchResult>| {
            let mut header = self.header_for(
                request,
                request_id,
                url,
                status,
                access_token.clone(),
                attempts.clone(),
            );
            header.chunk_number = Some(chunk_number);
            results.push(FetchResult {
                header,
                payload: FetchPayload::List(resources),
            });
        };

        while let Some(next) = stream.next().await {
            let bytes = match next {
                Ok(bytes) => bytes,
                Err(e) => {
                    let mut header = self.header_for(
                        request,
                        request_id,
                        url,
                        status,
                        access_token.clone(),
                        attempts.clone(),
                    );
                    header.chunk_number = Some(chunk_number);
                    header.error = Some(format!("Network error: {e}"));
                    results.push(FetchResult {
                        header,
                        payload: FetchPayload::Error { body: None },
                    });
                    return results;
                }
            };
            if let Some(handler) = &request.streaming_handler {
                if !handler(&bytes, chunk_number) {
                    tracing::debug!(url, chunk_number, "streaming consumer stopped the stream");
                    return results;
                }
            }
            buffer.extend_from_slice(&bytes);
            let resources = drain_complete_lines(&mut buffer);
            if !resources.is_empty() {
                emit(resources, chunk_number, &mut results);
                chunk_number += 1;
            }
        }

        // a final line without a trailing newline
        if !buffer.is_empty() {
            if let Some(resource) = parse_ndjson_line(&buffer) {
                emit(vec![resource], chunk_number, &mut results);
            }
        }
        results
    }
}

fn drain_complete_lines(buffer: &mut Vec<u8>) -> Vec<Value> {
    let mut resources = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        if let Some(resource) = parse_ndjson_line(&line[..line.len() - 1]) {
            resources.push(resource);
        }
    }
    resources
}

fn parse_ndjson_line(line: &[u8]) -> Option<Value> {
    let line = std::str::from_utf8(line).ok()?.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(error = %e, "skipping undecodable NDJSON line");
            None
        }
    }
}

fn attempt(url: &str, status: u16, retry_count: u32, start: OffsetDateTime, ok: bool) -> AttemptRecord {
    AttemptRecord {
        url: url.to_string(),
        status,
        retry_count,
        start,
        end: OffsetDateTime::now_utc(),
        ok,
    }
}

#[async_trait]
impl PageFetcher for FetchEngine {
    async fn fetch_page(&self, request: PageRequest) -> Vec<FetchResult> {
        let url = self.build_url(&request);
        let request_id = Uuid::new_v4();
        let accept = if self.use_data_streaming {
            ACCEPT_FHIR_NDJSON
        } else {
            ACCEPT_FHIR_JSON
        };

        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut retry_count: u32 = 0;
        let mut refresh_used = false;
        let overall_start = std::time::Instant::now();

        loop {
            let access_token = self.token.access_token().await;
            let mut http_request = self.http.get(&url).header(ACCEPT, accept);
            if let Some(token) = &access_token {
                http_request = http_request.bearer_auth(token);
            }

            let start = OffsetDateTime::now_utc();
            let outcome = match tokio::time::timeout(self.retry.request_timeout, http_request.send())
                .await
            {
                Ok(outcome) => outcome.map_err(|e| format!("Network error: {e}")),
                Err(_) => Err(format!(
                    "Request timed out after {:?}",
                    self.retry.request_timeout
                )),
            };
            let response = match outcome {
                Ok(response) => response,
                Err(message) => {
                    attempts.push(attempt(&url, 0, retry_count, start, false));
                    if self.retry.allows_retry(retry_count, overall_start.elapsed()) {
                        let delay = self.retry.backoff_delay(retry_count, None);
                        tracing::warn!(url = %url, error = %message, ?delay, "attempt failed, retrying");
                        tokio::time::sleep(delay).await;
                        retry_count += 1;
                        continue;
                    }
                    let mut header =
                        self.header_for(&request, request_id, &url, 0, access_token, attempts);
                    header.error = Some(message);
                    return vec![FetchResult {
                        header,
                        payload: FetchPayload::Error { body: None },
                    }];
                }
            };

            let status = response.status().as_u16();

            if RetryPolicy::is_retriable_status(status)
                && self.retry.allows_retry(retry_count, overall_start.elapsed())
            {
                let retry_after = (status == 429)
                    .then(|| {
                        response
                            .headers()
                            .get(RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(parse_retry_after)
                    })
                    .flatten();
                attempts.push(attempt(&url, status, retry_count, start, false));
                let delay = self.retry.backoff_delay(retry_count, retry_after);
                tracing::warn!(url = %url, status, ?delay, "retriable status, backing off");
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            if (status == 401 || status == 403) && !refresh_used {
                if let Some(refresh) = &self.refresh {
                    attempts.push(attempt(&url, status, retry_count, start, false));
                    let state = self.token.get().await;
                    tracing::warn!(url = %url, status, "authorization rejected, refreshing token");
                    let outcome = refresh(RefreshContext {
                        url: url.clone(),
                        status,
                        current_token: state.access_token,
                        expiry: state.expiry,
                        retry_count,
                    })
                    .await;
                    if outcome.abort_request || outcome.access_token.is_none() {
                        let mut header = self.header_for(
                            &request,
                            request_id,
                            &url,
                            status,
                            self.token.access_token().await,
                            attempts,
                        );
                        header.error = Some(status.to_string());
                        return vec![FetchResult {
                            header,
                            payload: FetchPayload::Error { body: None },
                        }];
                    }
                    self.token
                        .set(outcome.access_token, outcome.expiry_date)
                        .await;
                    refresh_used = true;
                    continue;
                }
            }

            let ok = (200..300).contains(&status);
            let etag = response
                .headers()
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let last_modified = response
                .headers()
                .get(LAST_MODIFIED)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| OffsetDateTime::parse(v, &Rfc2822).ok());

            if ok && self.use_data_streaming {
                attempts.push(attempt(&url, status, retry_count, start, true));
                let access_token = self.token.access_token().await;
                return self
                    .consume_ndjson(response, &request, request_id, &url, attempts, access_token)
                    .await;
            }

            let body_outcome =
                match tokio::time::timeout(self.retry.request_timeout, response.text()).await {
                    Ok(Ok(body)) => Ok(body),
                    Ok(Err(e)) => Err(format!("Network error: {e}")),
                    Err(_) => Err(format!(
                        "Request timed out after {:?}",
                        self.retry.request_timeout
                    )),
                };
            let body = match body_outcome {
                Ok(body) => body,
                Err(message) => {
                    attempts.push(attempt(&url, status, retry_count, start, false));
                    let mut header = self.header_for(
                        &request,
                        request_id,
                        &url,
                        status,
                        self.token.access_token().await,
                        attempts,
                    );
                    header.error = Some(message);
                    return vec![FetchResult {
                        header,
                        payload: FetchPayload::Error { body: None },
                    }];
                }
            };
            attempts.push(attempt(&url, status, retry_count, start, ok));

            let mut header = self.header_for(
                &request,
                request_id,
                &url,
                status,
                self.token.access_token().await,
                attempts,
            );
            header.etag = etag;
            header.last_modified = last_modified;
            if !ok {
                header.error = Some(status.to_string());
                tracing::debug!(url = %url, status, "request failed");
            } else {
                tracing::debug!(url = %url, status, "request succeeded");
            }
            return vec![FetchResult::from_body(header, &body)];
        }
    }
}
