//! Graph traversal.
//!
//! The walker owns one traversal: it resolves the start set, then follows
//! every link of the graph definition depth-first, handing each fetch to the
//! [`PageFetcher`] behind the concurrency gate and streaming results to the
//! caller over a channel as they complete. The request cache guarantees a
//! `(type, id)` pair is fetched at most once per traversal, which also makes
//! cyclic resource graphs terminate.
//!
//! Ordering: results arrive in completion order, not graph declaration
//! order. Links are walked in declaration order, but sibling chunk fetches
//! run concurrently up to the gate's limit.

use std::sync::Arc;

use futures_util::future::{BoxFuture, join_all};
use futures_util::{Stream, stream};
use tokio::sync::{Semaphore, mpsc, watch};

use fhirgraph_auth::ScopeSet;
use fhirgraph_core::{
    BundleEntry, GraphDefinition, GraphDefinitionLink, extract_references, parse_path,
};

use crate::cache::{CacheEntry, RequestCache};
use crate::coalesce::{IdSearchSupport, chunk_ids, dedupe_ids, expand_ref_params, missing_ids};
use crate::config::GraphOptions;
use crate::error::ClientError;
use crate::fetch::{PageFetcher, PageRequest};
use crate::response::{FetchPayload, FetchResult};

/// Cooperative cancellation for an in-flight traversal.
///
/// Cancelling stops new fetches, abandons in-flight ones, and discards the
/// request cache; results already emitted remain valid.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

pub(crate) struct WalkerContext {
    pub fetcher: Arc<dyn PageFetcher>,
    pub cache: Arc<RequestCache>,
    pub scopes: ScopeSet,
    pub gate: Arc<Semaphore>,
    pub options: GraphOptions,
    pub id_search: IdSearchSupport,
    pub cancel: watch::Receiver<bool>,
}

impl WalkerContext {
    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn base_parameters(&self) -> Vec<String> {
        if self.options.contained {
            vec!["contained=true".to_string()]
        } else {
            Vec::new()
        }
    }
}

async fn wait_cancelled(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            // sender gone; treat as never cancelled
            std::future::pending::<()>().await;
        }
    }
}

/// One traversal of one graph definition.
pub struct GraphWalker {
    ctx: Arc<WalkerContext>,
}

impl GraphWalker {
    pub(crate) fn new(ctx: WalkerContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    /// Start the traversal, returning the lazy result stream.
    ///
    /// Configuration problems (malformed graph, malformed path, missing
    /// `{ref}` token) surface here, before any I/O.
    pub fn walk(
        self,
        graph: GraphDefinition,
        start_ids: Vec<String>,
    ) -> Result<impl Stream<Item = FetchResult> + Send, ClientError> {
        graph.validate()?;
        validate_links(&graph.link)?;

        let (tx, rx) = mpsc::channel::<FetchResult>(32);
        let ctx = self.ctx;
        tokio::spawn(async move {
            tracing::info!(
                start = %graph.start,
                ids = start_ids.len(),
                links = graph.link.len(),
                "starting graph traversal"
            );
            let entries = fetch_group(&ctx, &graph.start, start_ids, &tx).await;
            if !entries.is_empty() {
                process_links(&ctx, &entries, &graph.link, &tx).await;
            }
            if ctx.cancelled() {
                tracing::debug!("traversal cancelled, discarding request cache");
                ctx.cache.clear();
            } else {
                tracing::info!(
                    cache_hits = ctx.cache.hits(),
                    cache_misses = ctx.cache.misses(),
                    "graph traversal complete"
                );
            }
        });

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|result| (result, rx))
        }))
    }
}

/// Reject malformed paths and reverse-link templates up front.
fn validate_links(links: &[GraphDefinitionLink]) -> Result<(), ClientError> {
    for link in links {
        if let Some(path) = &link.path {
            parse_path(path)?;
        }
        for target in &link.target {
            if link.path.is_none() {
                if let Some(params) = &target.params {
                    expand_ref_params(params, &[String::new()])?;
                }
            }
            validate_links(&target.link)?;
        }
    }
    Ok(())
}

/// Resolve a group of same-type ids: cached entries replay synthetically,
/// the rest are fetched in coalesced chunks. Returns every entry obtained,
/// cached first, for link recursion.
async fn fetch_group(
    ctx: &Arc<WalkerContext>,
    resource_type: &str,
    ids: Vec<String>,
    tx: &mpsc::Sender<FetchResult>,
) -> Vec<BundleEntry> {
    let ids = dedupe_ids(ids);
    if ids.is_empty() || ctx.cancelled() {
        return Vec::new();
    }

    if !ctx.scopes.scope_allows(resource_type) {
        tracing::debug!(resource_type, "skipping resource type denied by scope");
        for id in &ids {
            ctx.cache.add_negative(resource_type, id, 200);
        }
        let _ = tx.send(FetchResult::scope_denied(resource_type, ids)).await;
        return Vec::new();
    }

    let mut cached_entries: Vec<BundleEntry> = Vec::new();
    let mut non_cached: Vec<String> = Vec::new();
    for id in ids {
        match ctx.cache.get(resource_type, &id) {
            Some(entry) => {
                // negative entries are known-absent: nothing to replay
                if let Some(bundle_entry) = entry.bundle_entry {
                    cached_entries.push(bundle_entry);
                }
            }
            None => non_cached.push(id),
        }
    }

    if !cached_entries.is_empty() {
        tracing::debug!(
            resource_type,
            count = cached_entries.len(),
            "replaying cached resources"
        );
        let _ = tx
            .send(FetchResult::from_cache(resource_type, cached_entries.clone()))
            .await;
    }

    let mut entries = cached_entries;
    if non_cached.is_empty() {
        return entries;
    }

    let chunks: Vec<Vec<String>> = if ctx.id_search.is_unsupported(resource_type) {
        non_cached.iter().map(|id| vec![id.clone()]).collect()
    } else {
        chunk_ids(&non_cached, ctx.options.request_size)
    };

    let fetched = join_all(
        chunks
            .into_iter()
            .map(|chunk| fetch_chunk(ctx, resource_type, chunk, tx)),
    )
    .await;
    entries.extend(fetched.into_iter().flatten());
    entries
}

/// Fetch one id chunk, falling back to per-id requests when the server
/// rejects the id-set form for this type.
async fn fetch_chunk(
    ctx: &Arc<WalkerContext>,
    resource_type: &str,
    chunk: Vec<String>,
    tx: &mpsc::Sender<FetchResult>,
) -> Vec<BundleEntry> {
    let mut results = fetch_ids_once(ctx, resource_type, chunk.clone()).await;

    if chunk.len() > 1
        && results.len() == 1
        && IdSearchSupport::should_demote(results[0].header.status)
    {
        tracing::debug!(
            resource_type,
            status = results[0].header.status,
            "id-set search rejected, demoting to per-id requests"
        );
        ctx.id_search.mark_unsupported(resource_type);
        // keep the rejected batch's attempt records on the first replacement
        let mut carried = results.remove(0).header.results_by_url;
        let mut replacements = Vec::new();
        for id in &chunk {
            replacements.extend(fetch_ids_once(ctx, resource_type, vec![id.clone()]).await);
        }
        if let Some(first) = replacements.first_mut() {
            carried.extend(first.header.results_by_url.drain(..));
            first.header.results_by_url = carried;
        }
        results = replacements;
    }

    process_results(ctx, resource_type, results, tx).await
}

/// One gated round-trip through the fetch engine. Cancellation abandons the
/// request and yields nothing.
async fn fetch_ids_once(
    ctx: &Arc<WalkerContext>,
    resource_type: &str,
    ids: Vec<String>,
) -> Vec<FetchResult> {
    let request = PageRequest::by_ids(resource_type, ids).with_parameters(ctx.base_parameters());
    fetch_gated(ctx, request).await
}

async fn fetch_gated(ctx: &Arc<WalkerContext>, request: PageRequest) -> Vec<FetchResult> {
    if ctx.cancelled() {
        return Vec::new();
    }
    let permit = tokio::select! {
        _ = wait_cancelled(ctx.cancel.clone()) => return Vec::new(),
        permit = ctx.gate.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return Vec::new(),
        },
    };
    let results = tokio::select! {
        _ = wait_cancelled(ctx.cancel.clone()) => Vec::new(),
        results = ctx.fetcher.fetch_page(request) => results,
    };
    drop(permit);
    results
}

/// Populate the cache from fetched results, memoize ids the server did not
/// return, and forward every result to the caller. Returns the entries for
/// link recursion.
async fn process_results(
    ctx: &Arc<WalkerContext>,
    resource_type: &str,
    results: Vec<FetchResult>,
    tx: &mpsc::Sender<FetchResult>,
) -> Vec<BundleEntry> {
    let mut entries: Vec<BundleEntry> = Vec::new();
    for result in results {
        let result_entries = result.bundle_entries();
        for entry in &result_entries {
            let entry_type = entry.resource_type().unwrap_or(resource_type);
            if let Some(id) = entry.resource_id() {
                ctx.cache.add(CacheEntry {
                    resource_type: entry_type.to_string(),
                    resource_id: id.to_string(),
                    status: result.header.status,
                    bundle_entry: Some(entry.clone()),
                    last_modified: result.header.last_modified,
                    etag: result.header.etag.clone(),
                });
            }
        }

        // Negative entries memoize only ids a successful response did not
        // return; errors are never cached, a sibling path may refetch.
        // Each result is authoritative for the ids its own request named;
        // streamed chunks share one request and must not shadow each other.
        let missing = if result.header.chunk_number.is_none() && !result.is_error() {
            missing_ids(&result.header.ids, &result_entries)
        } else {
            Vec::new()
        };
        for id in &missing {
            ctx.cache
                .add_negative(resource_type, id, result.header.status);
        }
        // a batched success that skipped some ids still owes the caller a
        // negative result for them
        let owes_negative = !missing.is_empty() && result.header.ids.len() > 1;
        let _ = tx.send(result).await;
        if owes_negative {
            let negative = FetchResult {
                header: crate::response::ResponseHeader::new("", resource_type)
                    .with_ids(missing)
                    .with_status(200),
                payload: FetchPayload::List(Vec::new()),
            };
            let _ = tx.send(negative).await;
        }

        entries.extend(result_entries);
    }
    entries
}

/// Walk every link of a graph level against the given parent entries, in
/// declaration order.
fn process_links<'a>(
    ctx: &'a Arc<WalkerContext>,
    parents: &'a [BundleEntry],
    links: &'a [GraphDefinitionLink],
    tx: &'a mpsc::Sender<FetchResult>,
) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        for link in links {
            for target in &link.target {
                if ctx.cancelled() {
                    return;
                }
                let child_entries = if let Some(path) = &link.path {
                    forward_link(ctx, parents, path, &target.resource_type, tx).await
                } else if let Some(params) = &target.params {
                    reverse_link(ctx, parents, params, &target.resource_type, tx).await
                } else {
                    tracing::debug!(
                        resource_type = %target.resource_type,
                        "link has neither path nor params, skipping"
                    );
                    continue;
                };
                if !target.link.is_empty() && !child_entries.is_empty() {
                    process_links(ctx, &child_entries, &target.link, tx).await;
                }
            }
        }
    })
}

/// Forward link: dereference the path on every parent and fetch the
/// collected ids as one group.
async fn forward_link(
    ctx: &Arc<WalkerContext>,
    parents: &[BundleEntry],
    path: &str,
    target_type: &str,
    tx: &mpsc::Sender<FetchResult>,
) -> Vec<BundleEntry> {
    let mut ids: Vec<String> = Vec::new();
    for parent in parents {
        if let Some(resource) = &parent.resource {
            // paths were validated before I/O started
            match extract_references(resource, path, target_type) {
                Ok(found) => ids.extend(found),
                Err(e) => {
                    tracing::warn!(path, error = %e, "path extraction failed");
                }
            }
        }
    }
    let ids = dedupe_ids(ids);
    if ids.is_empty() {
        return Vec::new();
    }
    tracing::debug!(
        target_type,
        path,
        count = ids.len(),
        "following forward link"
    );
    fetch_group(ctx, target_type, ids, tx).await
}

/// Reverse link: substitute the parents' ids into the query template,
/// batched across siblings by `request_size`.
async fn reverse_link(
    ctx: &Arc<WalkerContext>,
    parents: &[BundleEntry],
    params: &str,
    target_type: &str,
    tx: &mpsc::Sender<FetchResult>,
) -> Vec<BundleEntry> {
    if !ctx.scopes.scope_allows(target_type) {
        tracing::debug!(target_type, "skipping resource type denied by scope");
        let _ = tx
            .send(FetchResult::scope_denied(target_type, Vec::new()))
            .await;
        return Vec::new();
    }

    let parent_ids: Vec<String> = parents
        .iter()
        .filter_map(|e| e.resource_id().map(str::to_string))
        .collect();
    let parent_ids = dedupe_ids(parent_ids);
    if parent_ids.is_empty() {
        return Vec::new();
    }
    tracing::debug!(
        target_type,
        params,
        parents = parent_ids.len(),
        "following reverse link"
    );

    let chunks = chunk_ids(&parent_ids, ctx.options.request_size);
    let fetched = join_all(chunks.into_iter().map(|chunk| async move {
        let Ok(mut parameters) = expand_ref_params(params, &chunk) else {
            return Vec::new();
        };
        parameters.extend(ctx.base_parameters());
        let results = fetch_gated(ctx, PageRequest::by_query(target_type, parameters)).await;
        process_results(ctx, target_type, results, tx).await
    }))
    .await;
    fetched.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::response::ResponseHeader;

    /// Canned fetcher: maps `Type/id` and `Type?query` to resources and
    /// counts every request it serves.
    struct StubFetcher {
        resources: HashMap<String, Value>,
        queries: HashMap<String, Vec<Value>>,
        log: Mutex<Vec<String>>,
    }

    impl StubFetcher {
        fn new() -> Self {
            Self {
                resources: HashMap::new(),
                queries: HashMap::new(),
                log: Mutex::new(Vec::new()),
            }
        }

        fn with_resource(mut self, resource: Value) -> Self {
            let key = format!(
                "{}/{}",
                resource["resourceType"].as_str().unwrap(),
                resource["id"].as_str().unwrap()
            );
            self.resources.insert(key, resource);
            self
        }

        fn with_query(mut self, key: &str, resources: Vec<Value>) -> Self {
            self.queries.insert(key.to_string(), resources);
            self
        }

        fn requests(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageFetcher for StubFetcher {
        async fn fetch_page(&self, request: PageRequest) -> Vec<FetchResult> {
            let key = if request.ids.len() == 1 {
                format!("{}/{}", request.resource_type, request.ids[0])
            } else if request.ids.len() > 1 {
                format!("{}?_id={}", request.resource_type, request.ids.join(","))
            } else {
                format!(
                    "{}?{}",
                    request.resource_type,
                    request.parameters.join("&")
                )
            };
            self.log.lock().unwrap().push(key.clone());
            let url = format!("http://stub/{key}");

            if request.ids.len() == 1 {
                let header = ResponseHeader::new(&url, &request.resource_type)
                    .with_ids(request.ids.clone());
                return match self.resources.get(&key) {
                    Some(resource) => {
                        vec![FetchResult::from_json(
                            header.with_status(200),
                            resource.clone(),
                        )]
                    }
                    None => {
                        let mut header = header.with_status(404);
                        header.error = Some("404".to_string());
                        vec![FetchResult {
                            header,
                            payload: FetchPayload::Error { body: None },
                        }]
                    }
                };
            }

            let resources: Vec<Value> = if request.ids.len() > 1 {
                request
                    .ids
                    .iter()
                    .filter_map(|id| {
                        self.resources
                            .get(&format!("{}/{id}", request.resource_type))
                            .cloned()
                    })
                    .collect()
            } else {
                self.queries.get(&key).cloned().unwrap_or_default()
            };
            let header = ResponseHeader::new(&url, &request.resource_type)
                .with_ids(request.ids.clone())
                .with_status(200);
            vec![FetchResult::from_json(header, json!(resources))]
        }
    }

    fn walker(fetcher: Arc<StubFetcher>, scopes: ScopeSet, options: GraphOptions) -> GraphWalker {
        let (_handle, cancel) = CancelHandle::new();
        GraphWalker::new(WalkerContext {
            fetcher,
            cache: Arc::new(RequestCache::new()),
            scopes,
            gate: Arc::new(Semaphore::new(4)),
            options,
            id_search: IdSearchSupport::new(),
            cancel,
        })
    }

    async fn drain(
        stream: impl Stream<Item = FetchResult> + Send,
    ) -> Vec<FetchResult> {
        stream.collect::<Vec<_>>().await
    }

    fn graph(value: Value) -> GraphDefinition {
        GraphDefinition::from_json(value).unwrap()
    }

    #[tokio::test]
    async fn test_start_only_traversal() {
        let fetcher = Arc::new(
            StubFetcher::new().with_resource(json!({"resourceType": "Patient", "id": "1"})),
        );
        let results = drain(
            walker(fetcher.clone(), ScopeSet::open(), GraphOptions::default())
                .walk(
                    graph(json!({"start": "Patient", "link": []})),
                    vec!["1".to_string()],
                )
                .unwrap(),
        )
        .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].resource_type_and_ids(), vec!["Patient/1"]);
        assert_eq!(fetcher.requests(), vec!["Patient/1"]);
    }

    #[tokio::test]
    async fn test_forward_link_dedupes_across_parents() {
        let fetcher = Arc::new(
            StubFetcher::new()
                .with_resource(json!({
                    "resourceType": "Patient", "id": "1",
                    "generalPractitioner": [{"reference": "Practitioner/12345"}]
                }))
                .with_resource(json!({
                    "resourceType": "Patient", "id": "2",
                    "generalPractitioner": [{"reference": "Practitioner/12345"}]
                }))
                .with_resource(json!({"resourceType": "Practitioner", "id": "12345"})),
        );
        let results = drain(
            walker(fetcher.clone(), ScopeSet::open(), GraphOptions::default())
                .walk(
                    graph(json!({
                        "start": "Patient",
                        "link": [{
                            "path": "generalPractitioner[x]",
                            "target": [{"type": "Practitioner"}]
                        }]
                    })),
                    vec!["1".to_string(), "2".to_string()],
                )
                .unwrap(),
        )
        .await;

        let practitioner_fetches = fetcher
            .requests()
            .iter()
            .filter(|r| r.starts_with("Practitioner"))
            .count();
        assert_eq!(practitioner_fetches, 1);
        let all: Vec<String> = results
            .iter()
            .flat_map(|r| r.resource_type_and_ids())
            .collect();
        assert!(all.contains(&"Practitioner/12345".to_string()));
    }

    #[tokio::test]
    async fn test_scope_denied_subtree_not_walked() {
        let fetcher = Arc::new(
            StubFetcher::new().with_resource(json!({"resourceType": "Patient", "id": "1"})),
        );
        let scopes = ScopeSet::parse(&["patient/Patient.read"]);
        let results = drain(
            walker(fetcher.clone(), scopes, GraphOptions::default())
                .walk(
                    graph(json!({
                        "start": "Patient",
                        "link": [{
                            "target": [{
                                "type": "Observation",
                                "params": "subject={ref}",
                                "link": [{
                                    "path": "performer[x]",
                                    "target": [{"type": "Practitioner"}]
                                }]
                            }]
                        }]
                    })),
                    vec!["1".to_string()],
                )
                .unwrap(),
        )
        .await;

        // no Observation or Practitioner request was ever issued
        assert_eq!(fetcher.requests(), vec!["Patient/1"]);
        let denied: Vec<&FetchResult> = results
            .iter()
            .filter(|r| r.header.resource_type == "Observation")
            .collect();
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].header.status, 200);
        assert!(denied[0].resources().is_empty());
    }

    #[tokio::test]
    async fn test_reverse_link_batched() {
        let fetcher = Arc::new(
            StubFetcher::new()
                .with_resource(json!({"resourceType": "Patient", "id": "1"}))
                .with_resource(json!({"resourceType": "Patient", "id": "2"}))
                .with_query(
                    "Observation?subject=1,2",
                    vec![
                        json!({"resourceType": "Observation", "id": "8"}),
                        json!({"resourceType": "Observation", "id": "9"}),
                    ],
                ),
        );
        let options = GraphOptions::default().with_request_size(10);
        let results = drain(
            walker(fetcher.clone(), ScopeSet::open(), options)
                .walk(
                    graph(json!({
                        "start": "Patient",
                        "link": [{
                            "target": [{"type": "Observation", "params": "subject={ref}"}]
                        }]
                    })),
                    vec!["1".to_string(), "2".to_string()],
                )
                .unwrap(),
        )
        .await;

        let observation_queries = fetcher
            .requests()
            .iter()
            .filter(|r| r.starts_with("Observation"))
            .count();
        assert_eq!(observation_queries, 1);
        let all: Vec<String> = results
            .iter()
            .flat_map(|r| r.resource_type_and_ids())
            .collect();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn test_cycle_terminates_via_cache() {
        // Patient -> Practitioner -> Patient (back-reference)
        let fetcher = Arc::new(
            StubFetcher::new()
                .with_resource(json!({
                    "resourceType": "Patient", "id": "1",
                    "generalPractitioner": [{"reference": "Practitioner/5"}]
                }))
                .with_resource(json!({
                    "resourceType": "Practitioner", "id": "5",
                    "patient": {"reference": "Patient/1"}
                })),
        );
        let results = drain(
            walker(fetcher.clone(), ScopeSet::open(), GraphOptions::default())
                .walk(
                    graph(json!({
                        "start": "Patient",
                        "link": [{
                            "path": "generalPractitioner[x]",
                            "target": [{
                                "type": "Practitioner",
                                "link": [{
                                    "path": "patient",
                                    "target": [{"type": "Patient"}]
                                }]
                            }]
                        }]
                    })),
                    vec!["1".to_string()],
                )
                .unwrap(),
        )
        .await;

        // Patient/1 fetched exactly once; the back-reference is a cache hit
        let patient_fetches = fetcher
            .requests()
            .iter()
            .filter(|r| *r == "Patient/1")
            .count();
        assert_eq!(patient_fetches, 1);
        let replayed: Vec<&FetchResult> =
            results.iter().filter(|r| r.header.cache_hits > 0).collect();
        assert_eq!(replayed.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_not_negative_cached() {
        // the same missing practitioner is reachable over two link paths;
        // the first failure must not be memoized as known-absent
        let fetcher = Arc::new(StubFetcher::new().with_resource(json!({
            "resourceType": "Patient", "id": "1",
            "generalPractitioner": [{"reference": "Practitioner/gone"}],
            "attender": {"reference": "Practitioner/gone"}
        })));
        let results = drain(
            walker(fetcher.clone(), ScopeSet::open(), GraphOptions::default())
                .walk(
                    graph(json!({
                        "start": "Patient",
                        "link": [
                            {
                                "path": "generalPractitioner[x]",
                                "target": [{"type": "Practitioner"}]
                            },
                            {
                                "path": "attender",
                                "target": [{"type": "Practitioner"}]
                            }
                        ]
                    })),
                    vec!["1".to_string()],
                )
                .unwrap(),
        )
        .await;

        let practitioner_fetches = fetcher
            .requests()
            .iter()
            .filter(|r| *r == "Practitioner/gone")
            .count();
        assert_eq!(practitioner_fetches, 2);
        let errors = results.iter().filter(|r| r.is_error()).count();
        assert_eq!(errors, 2);
    }

    #[tokio::test]
    async fn test_malformed_path_rejected_before_io() {
        let fetcher = Arc::new(StubFetcher::new());
        let result = walker(fetcher.clone(), ScopeSet::open(), GraphOptions::default()).walk(
            graph(json!({
                "start": "Patient",
                "link": [{"path": "a..b", "target": [{"type": "Practitioner"}]}]
            })),
            vec!["1".to_string()],
        );
        assert!(result.is_err());
        assert!(fetcher.requests().is_empty());
    }

    #[tokio::test]
    async fn test_missing_ref_token_rejected_before_io() {
        let fetcher = Arc::new(StubFetcher::new());
        let result = walker(fetcher.clone(), ScopeSet::open(), GraphOptions::default()).walk(
            graph(json!({
                "start": "Patient",
                "link": [{"target": [{"type": "Observation", "params": "subject=Patient/1"}]}]
            })),
            vec!["1".to_string()],
        );
        assert!(result.is_err());
        assert!(fetcher.requests().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_stops_new_fetches() {
        let fetcher = Arc::new(
            StubFetcher::new().with_resource(json!({"resourceType": "Patient", "id": "1"})),
        );
        let (handle, cancel) = CancelHandle::new();
        let cache = Arc::new(RequestCache::new());
        let walker = GraphWalker::new(WalkerContext {
            fetcher: fetcher.clone(),
            cache: cache.clone(),
            scopes: ScopeSet::open(),
            gate: Arc::new(Semaphore::new(1)),
            options: GraphOptions::default(),
            id_search: IdSearchSupport::new(),
            cancel,
        });
        handle.cancel();
        let results = drain(
            walker
                .walk(
                    graph(json!({"start": "Patient", "link": []})),
                    vec!["1".to_string()],
                )
                .unwrap(),
        )
        .await;
        assert!(results.is_empty());
        assert!(fetcher.requests().is_empty());
        assert!(cache.is_empty());
    }
}
