//! Persistent cache tier backed by sled.
//!
//! Entries never expire. The only ways out are explicit deletion and
//! size-cap eviction, which removes the oldest-stored entries until the
//! total falls back under the cap.
//!
//! Layout:
//! - tree `entries`: serde_json(`CacheKey`) -> serde_json(`DurableRecord`)
//! - tree `by_age`: be_u64(`stored_at_ms`) ++ serde_json(`CacheKey`) -> empty
//! - tree `meta`: `hits`, `misses`, `size_bytes` as big-endian u64
//!
//! An entry, its `by_age` key and `size_bytes` always change together in
//! one transaction.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sled::transaction::{ConflictableTransactionResult, TransactionError, TransactionalTree};
use sled::Transactional;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};
use crate::error::{ProxyError, Result};
use crate::metrics::Metrics;
use crate::upstream::CacheKey;

const TIER: &str = "durable";
const HITS: &str = "hits";
const MISSES: &str = "misses";
const SIZE_BYTES: &str = "size_bytes";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableRecord {
    pub value: Value,
    pub stored_at_ms: u64,
}

pub struct DurableCache {
    db: sled::Db,
    entries: sled::Tree,
    by_age: sled::Tree,
    meta: sled::Tree,
    size_limit: u64,
    evicting: Mutex<()>,
}

impl DurableCache {
    pub fn open(path: impl AsRef<Path>, size_limit: u64) -> Result<Self> {
        let db = sled::open(path)?;
        Self::with_db(db, size_limit)
    }

    fn with_db(db: sled::Db, size_limit: u64) -> Result<Self> {
        let cache = Self {
            entries: db.open_tree("entries")?,
            by_age: db.open_tree("by_age")?,
            meta: db.open_tree("meta")?,
            db,
            size_limit,
            evicting: Mutex::new(()),
        };
        if cache.by_age.is_empty() && !cache.entries.is_empty() {
            cache.rebuild_age_index()?;
        }
        Ok(cache)
    }

    /// Looks up `key`, counting a hit or a miss.
    pub fn get(&self, key: &CacheKey) -> Result<Option<Value>> {
        let raw = self.entries.get(encode_key(key)?)?;
        let record = match raw {
            Some(bytes) => Some(serde_json::from_slice::<DurableRecord>(&bytes)?),
            None => None,
        };

        match &record {
            Some(_) => {
                self.bump(HITS, 1)?;
                Metrics::record_cache_hit(TIER);
            }
            None => {
                self.bump(MISSES, 1)?;
                Metrics::record_cache_miss(TIER);
            }
        }
        Ok(record.map(|r| r.value))
    }

    /// Stores `value` under `key`, evicting older entries if the cap is
    /// exceeded. Returns `false` when the entry alone is larger than the cap.
    pub fn put(&self, key: &CacheKey, value: Value) -> Result<bool> {
        self.store(key, value, now_ms())
    }

    fn store(&self, key: &CacheKey, value: Value, stored_at_ms: u64) -> Result<bool> {
        let key_bytes = encode_key(key)?;
        let record = serde_json::to_vec(&DurableRecord { value, stored_at_ms })?;

        let entry_size = (key_bytes.len() + record.len()) as u64;
        if entry_size > self.size_limit {
            warn!(key = %key, bytes = entry_size, limit = self.size_limit, "entry exceeds durable cache size limit, not stored");
            return Ok(false);
        }

        let age = age_key(stored_at_ms, &key_bytes);
        let total = (&self.entries, &self.by_age, &self.meta)
            .transaction(|(entries, by_age, meta)| -> ConflictableTransactionResult<u64, ()> {
                let previous = entries.insert(key_bytes.as_slice(), record.as_slice())?;
                let mut delta = entry_size as i64;
                if let Some(old) = previous {
                    delta -= (key_bytes.len() + old.len()) as i64;
                    if let Some(old_at) = stored_at(&old) {
                        by_age.remove(age_key(old_at, &key_bytes))?;
                    }
                }
                by_age.insert(age.as_slice(), Vec::<u8>::new())?;
                adjust(meta, SIZE_BYTES, delta)
            })
            .map_err(storage_error)?;
        Metrics::record_durable_size(total);

        if total > self.size_limit {
            self.evict(&key_bytes)?;
        }
        Ok(true)
    }

    pub fn delete(&self, key: &CacheKey) -> Result<bool> {
        let key_bytes = encode_key(key)?;
        self.remove_raw(&key_bytes).map(|freed| freed.is_some())
    }

    pub fn iterate_keys(&self) -> Result<Vec<CacheKey>> {
        let mut keys = Vec::new();
        for item in self.entries.iter().keys() {
            let raw = item?;
            match serde_json::from_slice(&raw) {
                Ok(key) => keys.push(key),
                Err(e) => error!(error = %e, "undecodable durable cache key"),
            }
        }
        Ok(keys)
    }

    pub fn total_bytes(&self) -> Result<u64> {
        self.counter(SIZE_BYTES)
    }

    /// Persistent `(hits, misses)`.
    pub fn stats(&self) -> Result<(u64, u64)> {
        Ok((self.counter(HITS)?, self.counter(MISSES)?))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.entries.contains_key(encode_key(key)?)?)
    }

    pub fn size_limit(&self) -> u64 {
        self.size_limit
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Removes the entry and its age key and returns its size, keeping
    /// `size_bytes` in step.
    fn remove_raw(&self, key_bytes: &[u8]) -> Result<Option<u64>> {
        let freed = (&self.entries, &self.by_age, &self.meta)
            .transaction(|(entries, by_age, meta)| -> ConflictableTransactionResult<Option<(u64, u64)>, ()> {
                let Some(old) = entries.remove(key_bytes)? else {
                    return Ok(None);
                };
                if let Some(old_at) = stored_at(&old) {
                    by_age.remove(age_key(old_at, key_bytes))?;
                }
                let freed = (key_bytes.len() + old.len()) as u64;
                let total = adjust(meta, SIZE_BYTES, -(freed as i64))?;
                Ok(Some((freed, total)))
            })
            .map_err(storage_error)?;

        Ok(freed.map(|(freed, total)| {
            Metrics::record_durable_size(total);
            freed
        }))
    }

    /// Walks `by_age` from the oldest entry, removing until the total is
    /// back under the cap. `keep` is the entry that triggered the pass.
    fn evict(&self, keep: &[u8]) -> Result<()> {
        let _guard = self.evicting.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut total = self.total_bytes()?;
        let mut evicted = 0u64;
        for item in self.by_age.iter().keys() {
            if total <= self.size_limit {
                break;
            }
            let age = item?;
            let Some(key_bytes) = age.get(8..) else {
                self.by_age.remove(&age)?;
                continue;
            };
            if key_bytes == keep {
                continue;
            }
            match self.remove_raw(key_bytes)? {
                Some(_) => evicted += 1,
                // Left behind by an undecodable record.
                None => {
                    self.by_age.remove(&age)?;
                }
            }
            total = self.total_bytes()?;
        }

        if evicted > 0 {
            info!(evicted, size_bytes = total, limit = self.size_limit, "evicted durable cache entries");
            Metrics::record_evictions(evicted);
        }
        Ok(())
    }

    fn rebuild_age_index(&self) -> Result<()> {
        let mut indexed = 0u64;
        for item in self.entries.iter() {
            let (key_bytes, record) = item?;
            let stored_at_ms = stored_at(&record).unwrap_or(0);
            self.by_age.insert(age_key(stored_at_ms, &key_bytes), Vec::<u8>::new())?;
            indexed += 1;
        }
        info!(indexed, "rebuilt durable cache age index");
        Ok(())
    }

    fn counter(&self, name: &str) -> Result<u64> {
        Ok(self.meta.get(name)?.map(|v| decode_u64(&v)).unwrap_or(0))
    }

    fn bump(&self, name: &str, delta: i64) -> Result<u64> {
        let updated = self.meta.update_and_fetch(name, |old| {
            let next = apply_delta(old.map(decode_u64).unwrap_or(0), delta);
            Some(next.to_be_bytes().to_vec())
        })?;
        Ok(updated.map(|v| decode_u64(&v)).unwrap_or(0))
    }
}

fn adjust(meta: &TransactionalTree, name: &str, delta: i64) -> ConflictableTransactionResult<u64, ()> {
    let current = meta.get(name)?.map(|v| decode_u64(&v)).unwrap_or(0);
    let next = apply_delta(current, delta);
    meta.insert(name, &next.to_be_bytes()[..])?;
    Ok(next)
}

fn apply_delta(current: u64, delta: i64) -> u64 {
    if delta >= 0 {
        current.saturating_add(delta as u64)
    } else {
        current.saturating_sub(delta.unsigned_abs())
    }
}

fn storage_error(e: TransactionError<()>) -> ProxyError {
    match e {
        TransactionError::Storage(e) => ProxyError::Storage(e),
        TransactionError::Abort(()) => {
            ProxyError::Storage(sled::Error::Unsupported("durable cache transaction aborted".to_string()))
        }
    }
}

fn encode_key(key: &CacheKey) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(key)?)
}

fn age_key(stored_at_ms: u64, key_bytes: &[u8]) -> Vec<u8> {
    let mut age = Vec::with_capacity(8 + key_bytes.len());
    age.extend_from_slice(&stored_at_ms.to_be_bytes());
    age.extend_from_slice(key_bytes);
    age
}

fn stored_at(record: &[u8]) -> Option<u64> {
    serde_json::from_slice::<DurableRecord>(record).ok().map(|r| r.stored_at_ms)
}

fn decode_u64(bytes: &[u8]) -> u64 {
    <[u8; 8]>::try_from(bytes).map(u64::from_be_bytes).unwrap_or(0)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn key(action: &str, address: &str) -> CacheKey {
        CacheKey::new("x", "contract", action, address)
    }

    fn open(dir: &TempDir, limit: u64) -> DurableCache {
        DurableCache::open(dir.path(), limit).unwrap()
    }

    fn entry_size(key: &CacheKey, value: &Value) -> u64 {
        let record = serde_json::to_vec(&DurableRecord { value: value.clone(), stored_at_ms: now_ms() }).unwrap();
        (encode_key(key).unwrap().len() + record.len()) as u64
    }

    #[test]
    fn test_get_put_delete() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 1 << 20);
        let k = key("getsourcecode", "0xABC");

        assert_eq!(cache.get(&k).unwrap(), None);
        assert!(cache.put(&k, json!({ "result": [1] })).unwrap());
        assert_eq!(cache.get(&k).unwrap(), Some(json!({ "result": [1] })));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().unwrap(), (1, 1));

        assert!(cache.delete(&k).unwrap());
        assert!(!cache.delete(&k).unwrap());
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes().unwrap(), 0);
    }

    #[test]
    fn test_total_bytes_tracks_overwrites() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 1 << 20);
        let k = key("getabi", "0xABC");

        cache.put(&k, json!({ "result": "short" })).unwrap();
        let first = cache.total_bytes().unwrap();
        cache.put(&k, json!({ "result": "a considerably longer payload" })).unwrap();
        let second = cache.total_bytes().unwrap();

        assert!(second > first);
        assert_eq!(second, entry_size(&k, &json!({ "result": "a considerably longer payload" })));
    }

    #[test]
    fn test_iterate_keys() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 1 << 20);
        cache.put(&key("getabi", "0xA"), json!(1)).unwrap();
        cache.put(&key("getsourcecode", "0xA"), json!(2)).unwrap();
        cache.put(&key("getabi", "0xB"), json!(3)).unwrap();

        let mut keys = cache.iterate_keys().unwrap();
        keys.sort_by(|a, b| (&a.address, &a.action).cmp(&(&b.address, &b.action)));
        assert_eq!(
            keys,
            vec![key("getabi", "0xA"), key("getsourcecode", "0xA"), key("getabi", "0xB")]
        );
    }

    #[test]
    fn test_counters_persist_across_reopen() {
        let dir = TempDir::new().unwrap();
        let k = key("getabi", "0xABC");
        {
            let cache = open(&dir, 1 << 20);
            cache.get(&k).unwrap();
            cache.put(&k, json!({ "result": "[]" })).unwrap();
            cache.get(&k).unwrap();
            cache.get(&k).unwrap();
            cache.flush().unwrap();
        }

        let cache = open(&dir, 1 << 20);
        assert_eq!(cache.stats().unwrap(), (2, 1));
        assert!(cache.contains(&k).unwrap());
        assert!(cache.total_bytes().unwrap() > 0);
    }

    #[test]
    fn test_eviction_only_when_over_limit() {
        let dir = TempDir::new().unwrap();
        let value = json!({ "result": "0123456789" });
        let one = entry_size(&key("getabi", "0x1"), &value);
        let cache = open(&dir, one * 3);

        for address in ["0x1", "0x2", "0x3"] {
            cache.put(&key("getabi", address), value.clone()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(cache.len(), 3);

        cache.put(&key("getabi", "0x4"), value.clone()).unwrap();
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&key("getabi", "0x1")).unwrap());
        assert!(cache.contains(&key("getabi", "0x2")).unwrap());
        assert!(cache.contains(&key("getabi", "0x4")).unwrap());
        assert!(cache.total_bytes().unwrap() <= cache.size_limit());
    }

    #[test]
    fn test_eviction_follows_stored_at_not_key_order() {
        let dir = TempDir::new().unwrap();
        let value = json!({ "result": "0123456789" });
        let one = entry_size(&key("getabi", "0x1"), &value);
        let cache = open(&dir, one * 3);

        cache.store(&key("getabi", "0x1"), value.clone(), 1_700_000_000_300).unwrap();
        cache.store(&key("getabi", "0x2"), value.clone(), 1_700_000_000_100).unwrap();
        cache.store(&key("getabi", "0x3"), value.clone(), 1_700_000_000_200).unwrap();

        cache.store(&key("getabi", "0x4"), value.clone(), 1_700_000_000_400).unwrap();
        assert!(!cache.contains(&key("getabi", "0x2")).unwrap());
        assert_eq!(cache.len(), 3);

        cache.store(&key("getabi", "0x5"), value.clone(), 1_700_000_000_500).unwrap();
        assert!(!cache.contains(&key("getabi", "0x3")).unwrap());
        assert!(cache.contains(&key("getabi", "0x1")).unwrap());
        assert!(cache.contains(&key("getabi", "0x4")).unwrap());
        assert!(cache.contains(&key("getabi", "0x5")).unwrap());
        assert_eq!(cache.by_age.len(), 3);
    }

    #[test]
    fn test_age_index_tracks_overwrite_and_delete() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 1 << 20);
        let k = key("getabi", "0xABC");

        cache.store(&k, json!(1), 1_700_000_000_100).unwrap();
        cache.store(&k, json!(2), 1_700_000_000_200).unwrap();
        let ages: Vec<_> = cache.by_age.iter().keys().map(|age| age.unwrap()).collect();
        assert_eq!(ages, vec![sled::IVec::from(age_key(1_700_000_000_200, &encode_key(&k).unwrap()))]);

        assert!(cache.delete(&k).unwrap());
        assert!(cache.by_age.is_empty());
        assert_eq!(cache.total_bytes().unwrap(), 0);
    }

    #[test]
    fn test_age_index_is_rebuilt_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let cache = open(&dir, 1 << 20);
            cache.put(&key("getabi", "0x1"), json!(1)).unwrap();
            cache.put(&key("getabi", "0x2"), json!(2)).unwrap();
            cache.by_age.clear().unwrap();
            cache.flush().unwrap();
        }

        let cache = open(&dir, 1 << 20);
        assert_eq!(cache.by_age.len(), 2);
        assert!(cache.delete(&key("getabi", "0x1")).unwrap());
        assert_eq!(cache.by_age.len(), 1);
    }

    #[test]
    fn test_concurrent_puts_over_cap_keep_size_consistent() {
        let dir = TempDir::new().unwrap();
        let value = json!({ "result": "0123456789" });
        let one = entry_size(&key("getabi", "0x00"), &value);
        let cache = open(&dir, one * 5);

        std::thread::scope(|scope| {
            for t in 0..4 {
                let cache = &cache;
                let value = value.clone();
                scope.spawn(move || {
                    for i in 0..25 {
                        let address = format!("0x{}{}", t, i % 10);
                        cache.put(&key("getabi", &address), value.clone()).unwrap();
                    }
                });
            }
        });

        let actual: u64 = cache
            .entries
            .iter()
            .map(|item| {
                let (k, v) = item.unwrap();
                (k.len() + v.len()) as u64
            })
            .sum();
        let total = cache.total_bytes().unwrap();
        assert_eq!(total, actual);
        assert!(total <= cache.size_limit());
        assert_eq!(cache.by_age.len(), cache.len());
    }

    #[test]
    fn test_oversized_entry_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 16);
        assert!(!cache.put(&key("getabi", "0x1"), json!({ "result": "far too large for the cap" })).unwrap());
        assert!(cache.is_empty());
    }
}
