//! Traversal options.

use std::time::Duration;

/// Options recognized by a graph traversal.
///
/// Defaults follow the behavior of a plain `$graph` call: one id per
/// request, results flattened into a single collection bundle, unbounded
/// concurrency.
#[derive(Debug, Clone)]
pub struct GraphOptions {
    /// Maximum in-flight HTTP requests. `None` = unbounded, `Some(1)` =
    /// strictly sequential.
    pub max_concurrent_requests: Option<usize>,

    /// Page size sent as `_count` when a page number is also set.
    pub page_size: u32,

    /// Maximum ids per batched request.
    pub request_size: usize,

    /// Return a `resourceType -> resources` map instead of a bundle.
    pub separate_bundle_resources: bool,

    /// Flatten the assembled bundle into a plain resource list.
    pub expand_fhir_bundle: bool,

    /// Append `contained=true` to every request.
    pub contained: bool,

    /// Decode responses as newline-delimited JSON, one FetchResult per chunk.
    pub use_data_streaming: bool,

    /// Sort assembled resources by `resourceType` then `id`.
    pub sort_resources: bool,

    /// Materialize per-request errors as OperationOutcome resources in the
    /// assembled output.
    pub create_operation_outcome_for_error: bool,

    /// Collect every attempt record into the final GraphResult.
    pub log_all_response_urls: bool,

    /// Re-raise the first terminal error after assembly instead of returning
    /// a partial graph.
    pub throw_exception_on_error: bool,

    /// Cap on honoring a 429 `Retry-After` header.
    pub maximum_time_to_retry_on_429: Duration,

    /// Retries per request for transient failures.
    pub retry_count: u32,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            max_concurrent_requests: None,
            page_size: 10,
            request_size: 1,
            separate_bundle_resources: false,
            expand_fhir_bundle: true,
            contained: false,
            use_data_streaming: false,
            sort_resources: false,
            create_operation_outcome_for_error: false,
            log_all_response_urls: false,
            throw_exception_on_error: false,
            maximum_time_to_retry_on_429: Duration::from_secs(60),
            retry_count: 2,
        }
    }
}

impl GraphOptions {
    /// Creates a new options struct with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_concurrent_requests(mut self, max: Option<usize>) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub fn with_request_size(mut self, request_size: usize) -> Self {
        self.request_size = request_size.max(1);
        self
    }

    #[must_use]
    pub fn with_separate_bundle_resources(mut self, separate: bool) -> Self {
        self.separate_bundle_resources = separate;
        self
    }

    #[must_use]
    pub fn with_expand_fhir_bundle(mut self, expand: bool) -> Self {
        self.expand_fhir_bundle = expand;
        self
    }

    #[must_use]
    pub fn with_contained(mut self, contained: bool) -> Self {
        self.contained = contained;
        self
    }

    #[must_use]
    pub fn with_data_streaming(mut self, streaming: bool) -> Self {
        self.use_data_streaming = streaming;
        self
    }

    #[must_use]
    pub fn with_sort_resources(mut self, sort: bool) -> Self {
        self.sort_resources = sort;
        self
    }

    #[must_use]
    pub fn with_operation_outcome_for_error(mut self, create: bool) -> Self {
        self.create_operation_outcome_for_error = create;
        self
    }

    #[must_use]
    pub fn with_log_all_response_urls(mut self, log: bool) -> Self {
        self.log_all_response_urls = log;
        self
    }

    #[must_use]
    pub fn with_throw_exception_on_error(mut self, throw: bool) -> Self {
        self.throw_exception_on_error = throw;
        self
    }

    #[must_use]
    pub fn with_maximum_time_to_retry_on_429(mut self, max: Duration) -> Self {
        self.maximum_time_to_retry_on_429 = max;
        self
    }

    #[must_use]
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}
