//! Request orchestration across the cache tiers.
//!
//! ```text
//! resolve(key)
//!   └─ stampede guard (per key)
//!        ├─ durable hit ───────────────► Good(value)
//!        └─ durable miss
//!             └─ volatile get_or_fetch ─► upstream on volatile miss
//!                  ├─ Err ──────────────► UpstreamError, nothing cached
//!                  └─ classify
//!                       ├─ Good ────────► durable put, Good(value)
//!                       └─ NotVerified ─► NotVerified(value)
//! ```

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info};
use crate::cache::VolatileCache;
use crate::classify::{Classifier, Verdict};
use crate::durable::DurableCache;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::stampede::StampedeGuard;
use crate::upstream::{CacheKey, Fetcher};

/// Outcome of a successful resolve. A negative upstream answer is data,
/// not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Good(Value),
    NotVerified(Value),
}

impl Resolution {
    pub fn is_good(&self) -> bool {
        matches!(self, Resolution::Good(_))
    }

    pub fn into_value(self) -> Value {
        match self {
            Resolution::Good(value) | Resolution::NotVerified(value) => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub count: u64,
    pub size_bytes: u64,
}

pub struct Resolver<F> {
    durable: DurableCache,
    volatile: VolatileCache<F>,
    guard: StampedeGuard,
    classifier: Arc<dyn Classifier>,
}

impl<F: Fetcher> Resolver<F> {
    pub fn new(durable: DurableCache, volatile: VolatileCache<F>, classifier: Arc<dyn Classifier>) -> Self {
        Self {
            durable,
            volatile,
            guard: StampedeGuard::new(),
            classifier,
        }
    }

    pub async fn resolve(&self, key: &CacheKey) -> Result<Resolution> {
        self.guard.with_exclusive(key, || self.resolve_locked(key)).await
    }

    async fn resolve_locked(&self, key: &CacheKey) -> Result<Resolution> {
        if let Some(value) = self.durable.get(key)? {
            debug!(key = %key, "durable cache hit");
            return Ok(Resolution::Good(value));
        }

        let value = self.volatile.get_or_fetch(key).await?;
        let verdict = self.classifier.classify(key, &value);
        debug!(key = %key, verdict = verdict.as_str(), "classified upstream response");
        Metrics::record_classification(&key.explorer, verdict.as_str());

        match verdict {
            Verdict::Good => {
                // The fetch succeeded; a storage fault only costs a future refetch.
                if let Err(e) = self.durable.put(key, value.clone()) {
                    error!(key = %key, error = %e, "failed to persist response");
                }
                Ok(Resolution::Good(value))
            }
            Verdict::NotVerified => Ok(Resolution::NotVerified(value)),
        }
    }

    /// Deletes every durable entry for `(explorer, address)` across all
    /// modules and actions, and drops the matching volatile entries.
    /// Returns the number of durable entries removed.
    ///
    /// Each deletion runs under that key's stampede guard, so a resolve
    /// already in flight stores its result first and is then removed.
    pub async fn invalidate(&self, explorer: &str, address: &str) -> Result<u64> {
        let mut targets: Vec<CacheKey> = self
            .durable
            .iterate_keys()?
            .into_iter()
            .filter(|key| key.matches(explorer, address))
            .collect();
        for key in self.guard.keys() {
            if key.matches(explorer, address) && !targets.contains(&key) {
                targets.push(key);
            }
        }

        let mut deleted = 0u64;
        for key in &targets {
            if self.guard.with_exclusive(key, || async { self.durable.delete(key) }).await? {
                deleted += 1;
            }
        }
        let volatile = self.volatile.invalidate_address(explorer, address).await;

        info!(explorer, address, deleted, volatile, "invalidated cache entries");
        Metrics::record_invalidation(explorer, deleted);
        Ok(deleted)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let (hits, misses) = self.durable.stats()?;
        Ok(CacheStats {
            hits,
            misses,
            count: self.durable.len() as u64,
            size_bytes: self.durable.total_bytes()?,
        })
    }

    pub fn durable(&self) -> &DurableCache {
        &self.durable
    }

    pub fn volatile(&self) -> &VolatileCache<F> {
        &self.volatile
    }
}
