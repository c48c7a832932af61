//! TTL cache of successful primary responses, served by the cached fallback.

use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone)]
struct CachedEntry {
    value: Value,
    stored_at: Instant,
}

/// Bounded, time-limited response cache keyed by (operation type, cache key).
pub struct ResponseCache {
    ttl: Duration,
    capacity: usize,
    entries: DashMap<String, CachedEntry>,
}

impl ResponseCache {
    /// Create a cache holding at most `capacity` entries for `ttl` each.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: DashMap::new(),
        }
    }

    fn slot(operation_type: &str, key: &str) -> String {
        format!("{}:{}", operation_type, key)
    }

    /// Fresh cached value, if any. Expired entries are dropped on read.
    pub fn get(&self, operation_type: &str, key: &str) -> Option<Value> {
        let slot = Self::slot(operation_type, key);
        let entry = self.entries.get(&slot).map(|e| e.clone())?;

        if entry.stored_at.elapsed() > self.ttl {
            self.entries.remove(&slot);
            trace!(slot = %slot, "Cached response expired");
            return None;
        }
        Some(entry.value)
    }

    /// Store `value`, evicting the oldest entry when full.
    pub fn put(&self, operation_type: &str, key: &str, value: Value) {
        let slot = Self::slot(operation_type, key);
        if !self.entries.contains_key(&slot) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(
            slot,
            CachedEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.stored_at)
            .map(|e| e.key().clone());
        if let Some(slot) = oldest {
            self.entries.remove(&slot);
        }
    }

    /// Number of cached entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        self.entries.clear();
    }
}
