//! Observability counters for the rate limiter store and for HTTP traffic.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counters describing rate limiting behavior.
///
/// All counters use relaxed atomics: they are monotonic tallies read for
/// monitoring, never used for synchronization. Clones share the same counters.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    /// Total number of requests allowed through
    requests_allowed: AtomicU64,
    /// Total number of requests denied
    requests_denied: AtomicU64,
    /// Total number of client entries removed by eviction sweeps
    clients_evicted: AtomicU64,
    /// Total number of sweep iterations that panicked and were skipped
    sweeps_failed: AtomicU64,
}

impl Metrics {
    /// Create a new metrics tracker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
        }
    }

    pub(crate) fn record_allowed(&self) {
        self.inner.requests_allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_denied(&self) {
        self.inner.requests_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evictions(&self, count: usize) {
        self.inner
            .clients_evicted
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_sweep_failure(&self) {
        self.inner.sweeps_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the total number of requests allowed.
    pub fn requests_allowed(&self) -> u64 {
        self.inner.requests_allowed.load(Ordering::Relaxed)
    }

    /// Get the total number of requests denied.
    pub fn requests_denied(&self) -> u64 {
        self.inner.requests_denied.load(Ordering::Relaxed)
    }

    /// Get the total number of evicted client entries.
    pub fn clients_evicted(&self) -> u64 {
        self.inner.clients_evicted.load(Ordering::Relaxed)
    }

    /// Get the number of sweep iterations that failed.
    pub fn sweeps_failed(&self) -> u64 {
        self.inner.sweeps_failed.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_allowed: self.requests_allowed(),
            requests_denied: self.requests_denied(),
            clients_evicted: self.clients_evicted(),
            sweeps_failed: self.sweeps_failed(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// Total number of requests allowed through
    pub requests_allowed: u64,
    /// Total number of requests denied
    pub requests_denied: u64,
    /// Total number of evicted client entries
    pub clients_evicted: u64,
    /// Total number of failed sweep iterations
    pub sweeps_failed: u64,
}

impl MetricsSnapshot {
    /// Calculate the denial rate (0.0 to 1.0).
    ///
    /// Returns 0.0 if no requests have been checked.
    pub fn denial_rate(&self) -> f64 {
        let total = self.requests_allowed.saturating_add(self.requests_denied);
        if total == 0 {
            0.0
        } else {
            self.requests_denied as f64 / total as f64
        }
    }
}

/// Counters describing HTTP requests and the responses sent for them.
///
/// Fed by the [`track_requests`](crate::infrastructure::http::track_requests)
/// middleware. Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct RequestMetrics {
    inner: Arc<RequestMetricsInner>,
}

#[derive(Debug, Default)]
struct RequestMetricsInner {
    requests_received: AtomicU64,
    responses_sent: AtomicU64,
    processing_time_us: AtomicU64,
    responses_by_status: DashMap<u16, u64>,
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_received(&self) {
        self.inner.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_response(&self, status: u16, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.inner.responses_sent.fetch_add(1, Ordering::Relaxed);
        self.inner
            .processing_time_us
            .fetch_add(micros, Ordering::Relaxed);
        *self.inner.responses_by_status.entry(status).or_insert(0) += 1;
    }

    /// Requests that reached the middleware, answered or not.
    pub fn requests_received(&self) -> u64 {
        self.inner.requests_received.load(Ordering::Relaxed)
    }

    /// Responses returned through the middleware.
    pub fn responses_sent(&self) -> u64 {
        self.inner.responses_sent.load(Ordering::Relaxed)
    }

    /// Time spent producing all responses so far, at microsecond resolution.
    pub fn total_processing_time(&self) -> Duration {
        Duration::from_micros(self.inner.processing_time_us.load(Ordering::Relaxed))
    }

    /// Responses sent with the given status code.
    pub fn responses_with_status(&self, status: u16) -> u64 {
        self.inner
            .responses_by_status
            .get(&status)
            .map_or(0, |count| *count)
    }

    pub fn snapshot(&self) -> RequestMetricsSnapshot {
        RequestMetricsSnapshot {
            requests_received: self.requests_received(),
            responses_sent: self.responses_sent(),
            total_processing_time_us: self.inner.processing_time_us.load(Ordering::Relaxed),
            responses_by_status: self
                .inner
                .responses_by_status
                .iter()
                .map(|entry| (*entry.key(), *entry.value()))
                .collect(),
        }
    }
}

/// A point-in-time copy of [`RequestMetrics`], serializable as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct RequestMetricsSnapshot {
    pub requests_received: u64,
    pub responses_sent: u64,
    pub total_processing_time_us: u64,
    /// Keyed by numeric status code
    pub responses_by_status: BTreeMap<u16, u64>,
}

impl RequestMetricsSnapshot {
    /// Requests received but not yet answered.
    pub fn in_flight(&self) -> u64 {
        self.requests_received.saturating_sub(self.responses_sent)
    }

    /// Mean time per response, zero before the first one.
    pub fn average_processing_time(&self) -> Duration {
        match self.responses_sent {
            0 => Duration::ZERO,
            sent => Duration::from_micros(self.total_processing_time_us / sent),
        }
    }
}
