use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Instant;

pub struct Metrics;

impl Metrics {
    pub fn init(listen: SocketAddr) -> Result<(), BuildError> {
        PrometheusBuilder::new()
            .with_http_listener(listen)
            .install()
    }

    pub fn record_upstream_request(explorer: &str, success: bool, duration: f64) {
        let explorer = explorer.to_string();
        counter!("upstream_requests_total", 1, "explorer" => explorer.clone());
        histogram!("upstream_request_duration_seconds", duration, "explorer" => explorer.clone());

        if !success {
            counter!("upstream_failures_total", 1, "explorer" => explorer);
        }
    }

    pub fn record_cache_hit(tier: &'static str) {
        counter!("cache_hits_total", 1, "tier" => tier);
    }

    pub fn record_cache_miss(tier: &'static str) {
        counter!("cache_misses_total", 1, "tier" => tier);
    }

    pub fn record_classification(explorer: &str, verdict: &'static str) {
        counter!("classification_total", 1, "explorer" => explorer.to_string(), "verdict" => verdict);
    }

    pub fn record_evictions(count: u64) {
        counter!("durable_evictions_total", count);
    }

    pub fn record_invalidation(explorer: &str, deleted: u64) {
        counter!("durable_invalidations_total", deleted, "explorer" => explorer.to_string());
    }

    pub fn record_durable_size(bytes: u64) {
        gauge!("durable_size_bytes", bytes as f64);
    }
}

pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
