use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Mutex;
use crate::upstream::CacheKey;

/// Per-key mutual exclusion.
///
/// At most one caller runs `compute` for a given key at a time; callers for
/// other keys never wait on each other. Locks are created on first use and
/// kept for the life of the process.
pub struct StampedeGuard<K = CacheKey> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> StampedeGuard<K> {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Runs `compute` while holding the lock for `key`. The lock is released
    /// when `compute` finishes, whatever it returns.
    pub async fn with_exclusive<F, Fut, T>(&self, key: &K, compute: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        // Clone the Arc out so the shard lock is not held across the await.
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let _held = lock.lock().await;
        compute().await
    }

    /// Keys that have been guarded at least once.
    pub fn keys(&self) -> Vec<K> {
        self.locks.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

impl<K: Eq + Hash + Clone> Default for StampedeGuard<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let guard = Arc::new(StampedeGuard::<u32>::new());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let guard = guard.clone();
                let running = running.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    guard
                        .with_exclusive(&1, || async {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(guard.lock_count(), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_in_parallel() {
        let guard = Arc::new(StampedeGuard::<u32>::new());
        let start = Instant::now();

        let tasks: Vec<_> = (0..4)
            .map(|k| {
                let guard = guard.clone();
                tokio::spawn(async move {
                    guard
                        .with_exclusive(&k, || tokio::time::sleep(Duration::from_millis(200)))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(start.elapsed() < Duration::from_millis(600));
        assert_eq!(guard.lock_count(), 4);

        let mut keys = guard.keys();
        keys.sort_unstable();
        assert_eq!(keys, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_lock_released_on_error() {
        let guard = StampedeGuard::<u32>::new();
        let failed: Result<(), &str> = guard.with_exclusive(&7, || async { Err("boom") }).await;
        assert!(failed.is_err());

        let ok = tokio::time::timeout(
            Duration::from_millis(100),
            guard.with_exclusive(&7, || async { 42 }),
        )
        .await;
        assert_eq!(ok.unwrap(), 42);
    }
}
