//! Response cache with lazy TTL eviction

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Type-erased cached value, shared with every reader
pub type CachedValue = Arc<dyn Any + Send + Sync>;

/// A cached response and when it was stored
#[derive(Clone)]
pub struct CacheEntry {
    pub data: CachedValue,
    pub timestamp: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    /// Valid while `now - timestamp <= ttl`
    pub fn is_live(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.timestamp) <= self.ttl
    }
}

/// Keyed response cache
///
/// Expired entries are dropped when they are next looked up. Nothing sweeps
/// them in the background; `purge_expired` reclaims them on demand.
#[derive(Default)]
pub struct ResponseCache {
    entries: HashMap<String, CacheEntry>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live entry for `key`, evicting it if it has expired
    pub fn get(&mut self, key: &str) -> Option<CachedValue> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.data.clone()),
            Some(_) => {
                debug!(%key, "ResponseCache::get: expired, evicting");
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, data: CachedValue, ttl: Duration) {
        let key = key.into();
        debug!(%key, ?ttl, "ResponseCache::insert: called");
        self.entries.insert(
            key,
            CacheEntry {
                data,
                timestamp: Instant::now(),
                ttl,
            },
        );
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry whose key starts with `prefix`
    pub fn remove_prefix(&mut self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before - self.entries.len()
    }

    /// Stored entries, live or not
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
