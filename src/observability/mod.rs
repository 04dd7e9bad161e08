//! Observability module providing logging, metrics, and tracing.

mod logging;

pub use logging::{LogFormat, LogLevel, LoggingConfig};

use crate::errors::{CollectorResult, RateLimitInfo};
use crate::resilience::ThrottleSnapshot;
use crate::types::{EndpointKind, Phase, Surface};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn, Level};

/// Per-endpoint counters.
#[derive(Debug, Default)]
struct EndpointCounters {
    requests: AtomicU64,
    pages: AtomicU64,
    records: AtomicU64,
    retries: AtomicU64,
    throttle_waits: AtomicU64,
    failures: AtomicU64,
}

/// Metrics collector for a collection run.
///
/// Global counters cover every request; per-endpoint counters only see
/// requests that were tagged with an [`EndpointKind`].
#[derive(Debug, Default)]
pub struct Metrics {
    /// Total requests made.
    requests_total: AtomicU64,
    /// Successful requests.
    requests_success: AtomicU64,
    /// Failed requests.
    requests_failed: AtomicU64,
    /// Requests that were retried.
    requests_retried: AtomicU64,
    /// Requests that waited on a rate limit.
    requests_throttled: AtomicU64,
    /// Total time spent in throttle waits, in milliseconds.
    throttle_wait_ms: AtomicU64,
    /// Total request latency in microseconds.
    latency_total_us: AtomicU64,
    /// Request count for latency calculation.
    latency_count: AtomicU64,
    /// Per-endpoint counters, indexed by [`EndpointKind::index`].
    endpoints: [EndpointCounters; EndpointKind::ALL.len()],
}

impl Metrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    fn endpoint(&self, kind: Option<EndpointKind>) -> Option<&EndpointCounters> {
        kind.map(|k| &self.endpoints[k.index()])
    }

    /// Records a request.
    pub fn record_request(&self, endpoint: Option<EndpointKind>) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if let Some(c) = self.endpoint(endpoint) {
            c.requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a successful request.
    pub fn record_success(&self) {
        self.requests_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed request.
    pub fn record_failure(&self, endpoint: Option<EndpointKind>) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
        if let Some(c) = self.endpoint(endpoint) {
            c.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a retried request.
    pub fn record_retry(&self, endpoint: Option<EndpointKind>) {
        self.requests_retried.fetch_add(1, Ordering::Relaxed);
        if let Some(c) = self.endpoint(endpoint) {
            c.retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a throttled wait.
    pub fn record_throttle_wait(&self, endpoint: Option<EndpointKind>, wait: Duration) {
        self.requests_throttled.fetch_add(1, Ordering::Relaxed);
        self.throttle_wait_ms
            .fetch_add(wait.as_millis() as u64, Ordering::Relaxed);
        if let Some(c) = self.endpoint(endpoint) {
            c.throttle_waits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a fetched page.
    pub fn record_page(&self, endpoint: EndpointKind) {
        self.endpoints[endpoint.index()]
            .pages
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Records persisted records.
    pub fn record_records(&self, endpoint: EndpointKind, count: u64) {
        self.endpoints[endpoint.index()]
            .records
            .fetch_add(count, Ordering::Relaxed);
    }

    /// Records request latency.
    pub fn record_latency(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.latency_total_us.fetch_add(us, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Gets the total request count.
    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    /// Gets the retried request count.
    pub fn retried_requests(&self) -> u64 {
        self.requests_retried.load(Ordering::Relaxed)
    }

    /// Gets the throttled request count.
    pub fn throttled_requests(&self) -> u64 {
        self.requests_throttled.load(Ordering::Relaxed)
    }

    /// Gets the average latency in microseconds.
    pub fn average_latency_us(&self) -> u64 {
        let total = self.latency_total_us.load(Ordering::Relaxed);
        let count = self.latency_count.load(Ordering::Relaxed);
        if count == 0 {
            0
        } else {
            total / count
        }
    }

    /// Counters of one endpoint.
    pub fn endpoint_snapshot(&self, kind: EndpointKind) -> EndpointMetrics {
        let c = &self.endpoints[kind.index()];
        EndpointMetrics {
            endpoint: kind,
            requests: c.requests.load(Ordering::Relaxed),
            pages: c.pages.load(Ordering::Relaxed),
            records: c.records.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            throttle_waits: c.throttle_waits.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }

    /// Gets a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.total_requests(),
            requests_success: self.requests_success.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_retried: self.retried_requests(),
            requests_throttled: self.throttled_requests(),
            throttle_wait_ms: self.throttle_wait_ms.load(Ordering::Relaxed),
            average_latency_us: self.average_latency_us(),
            endpoints: EndpointKind::ALL
                .iter()
                .map(|k| self.endpoint_snapshot(*k))
                .collect(),
        }
    }
}

/// Counters of one endpoint at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointMetrics {
    /// Endpoint.
    pub endpoint: EndpointKind,
    /// Requests sent.
    pub requests: u64,
    /// Pages fetched.
    pub pages: u64,
    /// Records persisted.
    pub records: u64,
    /// Retries.
    pub retries: u64,
    /// Throttled waits.
    pub throttle_waits: u64,
    /// Failed requests.
    pub failures: u64,
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Total requests.
    pub requests_total: u64,
    /// Successful requests.
    pub requests_success: u64,
    /// Failed requests.
    pub requests_failed: u64,
    /// Retried requests.
    pub requests_retried: u64,
    /// Throttled requests.
    pub requests_throttled: u64,
    /// Time spent waiting on rate limits.
    pub throttle_wait_ms: u64,
    /// Average latency in microseconds.
    pub average_latency_us: u64,
    /// Per-endpoint counters.
    pub endpoints: Vec<EndpointMetrics>,
}

/// Tracing hooks for collector operations.
pub struct TracingHooks;

impl TracingHooks {
    /// Logs the start of an API request.
    pub fn on_request_start(surface: Surface, method: &str, url: &str) {
        debug!(
            surface = %surface,
            method = %method,
            url = %url,
            "GitHub API request started"
        );
    }

    /// Logs the headers of an API request at trace level, credentials redacted.
    pub fn on_request_headers(headers: &[(&str, &str)]) {
        if !tracing::enabled!(Level::TRACE) {
            return;
        }
        let rendered = headers
            .iter()
            .map(|(name, value)| format!("{}: {}", name, redact_header(name, value)))
            .collect::<Vec<_>>()
            .join(", ");
        trace!(headers = %rendered, "GitHub API request headers");
    }

    /// Logs the completion of an API request.
    pub fn on_request_complete(
        method: &str,
        url: &str,
        status: u16,
        duration: Duration,
        request_id: &str,
    ) {
        debug!(
            method = %method,
            url = %url,
            status = status,
            duration_ms = duration.as_millis() as u64,
            request_id = %request_id,
            "GitHub API request completed"
        );
    }

    /// Logs a request error.
    pub fn on_request_error(method: &str, url: &str, error: &str) {
        error!(
            method = %method,
            url = %url,
            error = %error,
            "GitHub API request failed"
        );
    }

    /// Logs a retry attempt.
    pub fn on_retry(method: &str, url: &str, attempt: u32, delay: Duration, reason: &str) {
        warn!(
            method = %method,
            url = %url,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Retrying GitHub API request"
        );
    }

    /// Logs a throttled response and the wait it caused.
    pub fn on_throttled(surface: Surface, url: &str, status: u16, wait: Duration) {
        warn!(
            surface = %surface,
            url = %url,
            status = status,
            wait_ms = wait.as_millis() as u64,
            "Rate limited, waiting for reset"
        );
    }

    /// Logs rate limit info.
    pub fn on_rate_limit_update(info: &RateLimitInfo) {
        debug!(
            limit = info.limit,
            remaining = info.remaining,
            reset_at = %info.reset_at,
            resource = info.resource.as_deref().unwrap_or("core"),
            "Rate limit updated"
        );
    }

    /// Logs the start of a unit.
    pub fn on_unit_start(repository: &str, endpoint: EndpointKind, resumed: bool) {
        debug!(
            repository = %repository,
            endpoint = %endpoint,
            resumed = resumed,
            "Unit started"
        );
    }

    /// Logs a finished unit.
    pub fn on_unit_complete(repository: &str, endpoint: EndpointKind, records: u64, absent: bool) {
        debug!(
            repository = %repository,
            endpoint = %endpoint,
            records = records,
            absent = absent,
            "Unit complete"
        );
    }

    /// Logs a failed unit.
    pub fn on_unit_failed(repository: &str, endpoint: EndpointKind, error: &str, retryable: bool) {
        error!(
            repository = %repository,
            endpoint = %endpoint,
            retryable = retryable,
            error = %error,
            "Unit failed"
        );
    }

    /// Logs the start of a phase.
    pub fn on_phase_start(phase: Phase, repositories: usize) {
        info!(phase = %phase, repositories = repositories, "Phase started");
    }

    /// Logs phase progress after a repository finishes.
    pub fn on_phase_progress(phase: Phase, done: usize, total: usize) {
        info!(phase = %phase, done = done, total = total, "Phase progress");
    }

    /// Logs the outcome of a phase.
    pub fn on_phase_finished(phase: Phase, status: &str, processed: usize, skipped: usize, errored: usize) {
        info!(
            phase = %phase,
            status = %status,
            processed = processed,
            skipped = skipped,
            errored = errored,
            "Phase finished"
        );
    }

    /// Logs a throttle snapshot for progress reporting.
    pub fn on_throttle_snapshot(snapshot: &ThrottleSnapshot) {
        info!(
            surface = %snapshot.surface,
            remaining = snapshot.quota.map(|q| q.remaining),
            limit = snapshot.quota.map(|q| q.limit),
            backoff_multiplier = snapshot.backoff_multiplier,
            window_count = snapshot.window_count,
            next_delay_ms = snapshot.next_delay.as_millis() as u64,
            "Throttle state"
        );
    }
}

/// Sensitive headers that should be redacted in logs.
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "x-github-token",
    "x-access-token",
    "cookie",
    "set-cookie",
];

/// Redacts sensitive values in headers.
pub fn redact_header(name: &str, value: &str) -> String {
    if SENSITIVE_HEADERS.contains(&name.to_lowercase().as_str()) {
        "[REDACTED]".to_string()
    } else {
        value.to_string()
    }
}

/// Installs the global `tracing` subscriber described by `config`.
pub fn init_logging(config: &LoggingConfig) -> CollectorResult<()> {
    config.clone().init()
}
