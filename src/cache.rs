use async_trait::async_trait;
use moka::future::Cache;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use crate::error::UpstreamError;
use crate::metrics::Metrics;
use crate::upstream::{CacheKey, Fetcher};

const TIER: &str = "volatile";

/// Short-lived in-memory tier in front of a [`Fetcher`].
///
/// Every successful upstream payload lands here, including negative ones
/// such as "not verified", and is served until the TTL runs out. Errors are
/// never cached. Concurrent misses for the same key share one fetch.
pub struct VolatileCache<F> {
    inner: F,
    entries: Cache<CacheKey, Value>,
}

impl<F: Fetcher> VolatileCache<F> {
    pub fn new(inner: F, ttl: Duration, capacity: u64) -> Self {
        Self {
            inner,
            entries: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        self.entries.get(key)
    }

    pub async fn get_or_fetch(&self, key: &CacheKey) -> Result<Value, UpstreamError> {
        if let Some(value) = self.entries.get(key) {
            debug!(key = %key, "volatile cache hit");
            Metrics::record_cache_hit(TIER);
            return Ok(value);
        }

        Metrics::record_cache_miss(TIER);
        self.entries
            .try_get_with(key.clone(), self.inner.fetch(key))
            .await
            .map_err(|e| (*e).clone())
    }

    /// Drops every live entry for `(explorer, address)`.
    pub async fn invalidate_address(&self, explorer: &str, address: &str) -> usize {
        let stale: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(key, _)| key.matches(explorer, address))
            .map(|(key, _)| (*key).clone())
            .collect();

        for key in &stale {
            self.entries.invalidate(key).await;
        }
        stale.len()
    }
}

#[async_trait]
impl<F: Fetcher> Fetcher for VolatileCache<F> {
    async fn fetch(&self, key: &CacheKey) -> Result<Value, UpstreamError> {
        self.get_or_fetch(key).await
    }
}
