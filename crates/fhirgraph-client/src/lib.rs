//! Simulated `$graph` traversal for FHIR servers without native `$graph`
//! support.
//!
//! Given a [`fhirgraph_core::GraphDefinition`] and a set of starting ids,
//! [`FhirGraphClient`] walks every forward and reverse link over plain REST
//! reads, deduplicating through a per-traversal request cache, enforcing
//! scope restrictions, bounding concurrency, refreshing expired tokens, and
//! streaming [`FetchResult`]s back as responses complete.

pub mod assemble;
pub mod cache;
pub mod client;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod fetch;
pub mod response;
pub mod retry;
pub mod walker;

pub use assemble::{GraphOutput, assemble, operation_outcome};
pub use cache::{CacheEntry, RequestCache};
pub use client::{FhirGraphClient, FhirGraphClientBuilder, GraphResult, GraphTraversal};
pub use config::GraphOptions;
pub use error::{ClientError, Result};
pub use fetch::{FetchEngine, PageFetcher, PageRequest, StreamingChunkHandler};
pub use response::{AttemptRecord, FetchPayload, FetchResult, ResponseHeader};
pub use retry::RetryPolicy;
pub use walker::CancelHandle;

pub use fhirgraph_auth::{
    RefreshContext, RefreshOutcome, RefreshTokenCallback, ScopeSet, refresh_callback,
};
pub use fhirgraph_core::{Bundle, BundleEntry, GraphDefinition};
