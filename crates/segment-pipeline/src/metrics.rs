use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Counters for one pipeline instance.
///
/// All counters use relaxed atomics; they are diagnostics, not synchronization.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Network requests that completed successfully
    pub requests_total: AtomicU64,
    /// Bytes received over the network
    pub bytes_total: AtomicU64,
    /// Sum of request durations in milliseconds
    pub latency_sum_ms: AtomicU64,
    /// Attempts that failed and were retried
    pub retries_total: AtomicU64,
    /// Requests that failed fatally after the retry budget
    pub load_errors: AtomicU64,
    /// Payloads the parser rejected
    pub parse_errors: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, bytes: u64, latency_ms: u64) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_total.fetch_add(bytes, Ordering::Relaxed);
        self.latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load_error(&self) {
        self.load_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Average throughput in bytes per second
    ///
    /// Returns None if no request time has been recorded
    pub fn average_throughput(&self) -> Option<f64> {
        let total_bytes = self.bytes_total.load(Ordering::Relaxed);
        let total_latency_ms = self.latency_sum_ms.load(Ordering::Relaxed);
        if total_latency_ms == 0 {
            return None;
        }
        Some(total_bytes as f64 / (total_latency_ms as f64 / 1000.0))
    }

    /// Cache hit rate (0.0 to 1.0), 0.0 when the cache was never consulted
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            bytes_total: self.bytes_total.load(Ordering::Relaxed),
            latency_sum_ms: self.latency_sum_ms.load(Ordering::Relaxed),
            retries_total: self.retries_total.load(Ordering::Relaxed),
            load_errors: self.load_errors.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self, label: &str) {
        let snapshot = self.snapshot();
        let throughput = self
            .average_throughput()
            .map(format_bytes_per_sec)
            .unwrap_or_else(|| "N/A".to_string());

        info!(
            pipeline = label,
            requests = snapshot.requests_total,
            bytes = snapshot.bytes_total,
            retries = snapshot.retries_total,
            load_errors = snapshot.load_errors,
            parse_errors = snapshot.parse_errors,
            cache_hits = snapshot.cache_hits,
            cache_misses = snapshot.cache_misses,
            cache_hit_rate = format!("{:.1}%", self.cache_hit_rate() * 100.0),
            avg_throughput = %throughput,
            "Segment pipeline summary"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub bytes_total: u64,
    pub latency_sum_ms: u64,
    pub retries_total: u64,
    pub load_errors: u64,
    pub parse_errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

fn format_bytes_per_sec(bytes_per_sec: f64) -> String {
    if bytes_per_sec >= 1_000_000.0 {
        format!("{:.2} MB/s", bytes_per_sec / 1_000_000.0)
    } else if bytes_per_sec >= 1_000.0 {
        format!("{:.2} KB/s", bytes_per_sec / 1_000.0)
    } else {
        format!("{:.2} B/s", bytes_per_sec)
    }
}
