//! Retry policy for transient failures.
//!
//! Retriable statuses are 429 plus the transient 5xx family; network errors
//! retry the same way. Backoff is exponential with jitter. A 429 carrying
//! `Retry-After` is honored up to the configured cap.

use std::time::Duration;

/// Statuses that warrant a retry.
const RETRIABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries per request beyond the first attempt.
    pub retry_count: u32,
    /// Cap on honoring a 429 `Retry-After`.
    pub maximum_time_to_retry_on_429: Duration,
    /// First backoff step; doubles per retry.
    pub base_delay: Duration,
    /// Per-attempt deadline; an attempt exceeding it counts as a network
    /// failure and retries.
    pub request_timeout: Duration,
    /// Wall-clock budget for one request including all its retries; once
    /// exhausted the failure is terminal.
    pub total_request_budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 2,
            maximum_time_to_retry_on_429: Duration::from_secs(60),
            base_delay: Duration::from_millis(250),
            request_timeout: Duration::from_secs(30),
            total_request_budget: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    pub fn is_retriable_status(status: u16) -> bool {
        RETRIABLE_STATUSES.contains(&status)
    }

    /// Whether another retry is allowed after `attempt` retries so far,
    /// given how long this request has already been running.
    pub fn allows_retry(&self, attempt: u32, elapsed: Duration) -> bool {
        attempt < self.retry_count && elapsed < self.total_request_budget
    }

    /// Delay before retry number `attempt` (0-based).
    ///
    /// `retry_after` comes from a 429 `Retry-After` header and takes
    /// precedence, capped by `maximum_time_to_retry_on_429`.
    pub fn backoff_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(retry_after) = retry_after {
            return retry_after.min(self.maximum_time_to_retry_on_429);
        }
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        // jitter up to half the step spreads out synchronized retries
        let jitter_ms = fastrand::u64(0..=(exp.as_millis() as u64 / 2).max(1));
        exp + Duration::from_millis(jitter_ms)
    }
}

/// Parse a `Retry-After` header value in delta-seconds form.
///
/// The HTTP-date form is not parsed; callers fall back to the computed
/// backoff delay.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
