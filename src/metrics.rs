//! Metrics collection for the preview cache
//!
//! This module provides thread-safe metrics collection using atomic operations.
//! It tracks requests, cache hits/misses, population workers and byte flow.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Metrics collector for the proxy
///
/// All operations are thread-safe using atomic operations.
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    // Request statistics
    total_requests: AtomicU64,
    range_requests: AtomicU64,
    failed_requests: AtomicU64,

    // Cache statistics
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_errors: AtomicU64,

    // Tee statistics
    tee_streams: AtomicU64,
    tee_cached_streams: AtomicU64,

    // Worker statistics
    workers_started: AtomicU64,
    workers_suppressed: AtomicU64,
    workers_completed: AtomicU64,
    workers_failed: AtomicU64,

    // Byte statistics
    bytes_from_origin: AtomicU64,
    bytes_from_cache: AtomicU64,
    bytes_to_client: AtomicU64,

    // Time until response headers were ready, in microseconds
    total_request_duration_us: AtomicU64,
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub range_requests: u64,
    pub failed_requests: u64,

    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_errors: u64,

    pub tee_streams: u64,
    pub tee_cached_streams: u64,

    pub workers_started: u64,
    pub workers_suppressed: u64,
    pub workers_completed: u64,
    pub workers_failed: u64,

    pub bytes_from_origin: u64,
    pub bytes_from_cache: u64,
    pub bytes_to_client: u64,

    pub total_request_duration_us: u64,
}

impl ProxyMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a content request
    ///
    /// # Arguments
    /// * `ranged` - Whether the client sent a `Range` header
    pub fn record_request(&self, ranged: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if ranged {
            self.range_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a request that ended in an error response
    pub fn record_request_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request served from a complete cache entry
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request that found no complete cache entry
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failure reading a complete cache entry
    pub fn record_cache_error(&self) {
        self.cache_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a tee stream
    ///
    /// # Arguments
    /// * `caching` - Whether the stream obtained the writer for the data file
    pub fn record_tee_stream(&self, caching: bool) {
        self.tee_streams.fetch_add(1, Ordering::Relaxed);
        if caching {
            self.tee_cached_streams.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_worker_started(&self) {
        self.workers_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request that did not start a worker because one was running
    /// or the cache was over its admission cap
    pub fn record_worker_suppressed(&self) {
        self.workers_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished worker
    ///
    /// # Arguments
    /// * `success` - Whether the worker published a completion marker
    pub fn record_worker_finished(&self, success: bool) {
        if success {
            self.workers_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.workers_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_bytes_from_origin(&self, bytes: u64) {
        self.bytes_from_origin.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_bytes_from_cache(&self, bytes: u64) {
        self.bytes_from_cache.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_bytes_to_client(&self, bytes: u64) {
        self.bytes_to_client.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record the time taken to produce response headers
    pub fn record_request_duration(&self, duration: Duration) {
        self.total_request_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    ///
    /// Fields are loaded independently, so the snapshot may not be perfectly
    /// consistent across fields under concurrent load.
    pub fn get_stats(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            range_requests: self.range_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_errors: self.cache_errors.load(Ordering::Relaxed),
            tee_streams: self.tee_streams.load(Ordering::Relaxed),
            tee_cached_streams: self.tee_cached_streams.load(Ordering::Relaxed),
            workers_started: self.workers_started.load(Ordering::Relaxed),
            workers_suppressed: self.workers_suppressed.load(Ordering::Relaxed),
            workers_completed: self.workers_completed.load(Ordering::Relaxed),
            workers_failed: self.workers_failed.load(Ordering::Relaxed),
            bytes_from_origin: self.bytes_from_origin.load(Ordering::Relaxed),
            bytes_from_cache: self.bytes_from_cache.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
            total_request_duration_us: self.total_request_duration_us.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    /// Calculate cache hit rate as a percentage (0.0 to 100.0)
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            (self.cache_hits as f64 / total as f64) * 100.0
        }
    }

    /// Calculate average time to response headers in milliseconds
    pub fn avg_request_duration_ms(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.total_request_duration_us as f64 / self.total_requests as f64) / 1000.0
        }
    }

    /// Workers currently in flight, derived from start/finish counters
    pub fn workers_active(&self) -> u64 {
        self.workers_started
            .saturating_sub(self.workers_completed + self.workers_failed)
    }
}
