use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use crate::config::Config;

/// Round-robin API keys for one explorer.
#[derive(Debug)]
struct KeyRing {
    keys: Vec<String>,
    cursor: AtomicUsize,
}

impl KeyRing {
    fn new(keys: Vec<String>) -> Self {
        Self {
            keys,
            cursor: AtomicUsize::new(0),
        }
    }

    fn next(&self) -> Option<&str> {
        if self.keys.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.keys.len();
        Some(&self.keys[idx])
    }
}

/// Per-explorer key rotation shared by every fetch against that explorer.
#[derive(Debug, Default)]
pub struct KeyPool {
    rings: HashMap<String, KeyRing>,
}

impl KeyPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        let mut pool = Self::new();
        for (name, explorer) in &config.explorers {
            pool.insert(name.clone(), explorer.keys.clone());
        }
        pool
    }

    pub fn insert(&mut self, explorer: impl Into<String>, keys: Vec<String>) {
        self.rings.insert(explorer.into(), KeyRing::new(keys));
    }

    /// Next key for `explorer`, or `None` when it has no keys configured.
    pub fn next_key(&self, explorer: &str) -> Option<&str> {
        self.rings.get(explorer).and_then(KeyRing::next)
    }
}
