//! The client facade.
//!
//! [`FhirGraphClient`] ties the pieces together: it owns the HTTP connection
//! pool and the configuration, and spins up one traversal context (request
//! cache, token state, concurrency gate) per `simulate_graph` call. Nothing
//! is shared across traversals except the connection pool.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use tokio::sync::Semaphore;
use url::Url;

use fhirgraph_auth::{RefreshTokenCallback, ScopeSet, SharedToken};
use fhirgraph_core::GraphDefinition;

use crate::assemble::{GraphOutput, assemble};
use crate::cache::RequestCache;
use crate::coalesce::IdSearchSupport;
use crate::config::GraphOptions;
use crate::error::{ClientError, Result};
use crate::fetch::FetchEngine;
use crate::response::{AttemptRecord, FetchResult, ResponseHeader};
use crate::retry::RetryPolicy;
use crate::walker::{CancelHandle, GraphWalker, WalkerContext};

/// Builder for [`FhirGraphClient`].
pub struct FhirGraphClientBuilder {
    base_url: String,
    access_token: Option<String>,
    refresh: Option<RefreshTokenCallback>,
    auth_scopes: Vec<String>,
    options: GraphOptions,
    http: Option<reqwest::Client>,
}

impl FhirGraphClientBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            access_token: None,
            refresh: None,
            auth_scopes: Vec::new(),
            options: GraphOptions::default(),
            http: None,
        }
    }

    #[must_use]
    pub fn with_access_token(mut self, access_token: impl Into<String>) -> Self {
        self.access_token = Some(access_token.into());
        self
    }

    #[must_use]
    pub fn with_refresh_callback(mut self, refresh: RefreshTokenCallback) -> Self {
        self.refresh = Some(refresh);
        self
    }

    /// Scopes restricting which resource types may be fetched. An empty list
    /// permits everything.
    #[must_use]
    pub fn with_auth_scopes<S: Into<String>>(
        mut self,
        scopes: impl IntoIterator<Item = S>,
    ) -> Self {
        self.auth_scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: GraphOptions) -> Self {
        self.options = options;
        self
    }

    /// Reuse an existing connection pool.
    #[must_use]
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn build(self) -> Result<FhirGraphClient> {
        let base_url = Url::parse(&self.base_url)?;
        Ok(FhirGraphClient {
            http: self.http.unwrap_or_default(),
            base_url,
            access_token: self.access_token,
            refresh: self.refresh,
            scopes: ScopeSet::parse(&self.auth_scopes),
            options: self.options,
        })
    }
}

/// A client that simulates the `$graph` operation against servers that only
/// support plain REST reads.
pub struct FhirGraphClient {
    http: reqwest::Client,
    base_url: Url,
    access_token: Option<String>,
    refresh: Option<RefreshTokenCallback>,
    scopes: ScopeSet,
    options: GraphOptions,
}

/// One in-flight traversal: the result stream plus its cancellation handle.
pub struct GraphTraversal {
    stream: BoxStream<'static, FetchResult>,
    cancel: CancelHandle,
    cache: Arc<RequestCache>,
    token: SharedToken,
}

impl GraphTraversal {
    /// Handle for cancelling this traversal from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Cache hit/miss counters for the traversal so far.
    pub fn cache_stats(&self) -> (usize, usize) {
        (self.cache.hits(), self.cache.misses())
    }

    /// The access token currently in force (rotated by refreshes).
    pub async fn access_token(&self) -> Option<String> {
        self.token.access_token().await
    }
}

impl Stream for GraphTraversal {
    type Item = FetchResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.poll_next_unpin(cx)
    }
}

/// The assembled outcome of a drained traversal.
#[derive(Debug)]
pub struct GraphResult {
    pub output: GraphOutput,
    pub cache_hits: usize,
    pub cache_misses: usize,
    /// Headers of every result that carried an error.
    pub errors: Vec<ResponseHeader>,
    /// Every attempt record, populated when `log_all_response_urls` is set.
    pub results_by_url: Vec<AttemptRecord>,
    /// The access token in force at the end of the traversal.
    pub access_token: Option<String>,
}

impl FhirGraphClient {
    pub fn builder(base_url: impl Into<String>) -> FhirGraphClientBuilder {
        FhirGraphClientBuilder::new(base_url)
    }

    /// Start a traversal and return the lazy result stream.
    ///
    /// `start_ids` entries may themselves be comma-separated lists. The
    /// graph definition is validated before any request is issued.
    pub fn simulate_graph_streaming<S: Into<String>>(
        &self,
        start_ids: impl IntoIterator<Item = S>,
        graph_json: serde_json::Value,
    ) -> Result<GraphTraversal> {
        let graph = GraphDefinition::from_json(graph_json)?;
        let start_ids = normalize_ids(start_ids);

        let token = SharedToken::new(self.access_token.clone());
        let retry = RetryPolicy {
            retry_count: self.options.retry_count,
            maximum_time_to_retry_on_429: self.options.maximum_time_to_retry_on_429,
            ..RetryPolicy::default()
        };
        let engine = FetchEngine::new(
            self.http.clone(),
            self.base_url.clone(),
            token.clone(),
            self.refresh.clone(),
            retry,
            self.options.use_data_streaming,
        );

        let cache = Arc::new(RequestCache::new());
        let (cancel, cancel_rx) = CancelHandle::new();
        let permits = self
            .options
            .max_concurrent_requests
            .unwrap_or(Semaphore::MAX_PERMITS);
        let walker = GraphWalker::new(WalkerContext {
            fetcher: Arc::new(engine),
            cache: Arc::clone(&cache),
            scopes: self.scopes.clone(),
            gate: Arc::new(Semaphore::new(permits)),
            options: self.options.clone(),
            id_search: IdSearchSupport::new(),
            cancel: cancel_rx,
        });

        let stream = walker.walk(graph, start_ids)?.boxed();
        Ok(GraphTraversal {
            stream,
            cancel,
            cache,
            token,
        })
    }

    /// Run a traversal to completion and assemble the final output.
    pub async fn simulate_graph<S: Into<String>>(
        &self,
        start_ids: impl IntoIterator<Item = S>,
        graph_json: serde_json::Value,
    ) -> Result<GraphResult> {
        let mut traversal = self.simulate_graph_streaming(start_ids, graph_json)?;

        let mut entries = Vec::new();
        let mut errors: Vec<ResponseHeader> = Vec::new();
        let mut results_by_url: Vec<AttemptRecord> = Vec::new();
        while let Some(result) = traversal.next().await {
            if self.options.log_all_response_urls {
                results_by_url.extend(result.header.results_by_url.iter().cloned());
            }
            if result.is_error() {
                errors.push(result.header.clone());
            } else {
                // cache replays repeat entries already collected; assembly
                // dedupes them
                entries.extend(result.bundle_entries());
            }
        }

        let (cache_hits, cache_misses) = traversal.cache_stats();
        let access_token = traversal.access_token().await;
        let output = assemble(entries, &errors, &self.options);

        // the cache's lifetime ends with the traversal
        traversal.cache.clear();

        if self.options.throw_exception_on_error {
            if let Some(error) = errors.first() {
                return Err(ClientError::http(error.status, error.url.clone()));
            }
        }

        Ok(GraphResult {
            output,
            cache_hits,
            cache_misses,
            errors,
            results_by_url,
            access_token,
        })
    }
}

fn normalize_ids<S: Into<String>>(ids: impl IntoIterator<Item = S>) -> Vec<String> {
    ids.into_iter()
        .flat_map(|id| {
            id.into()
                .split(',')
                .map(|part| part.trim().to_string())
                .collect::<Vec<_>>()
        })
        .filter(|id| !id.is_empty())
        .collect()
}
