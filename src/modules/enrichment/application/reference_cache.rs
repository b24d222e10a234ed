use crate::shared::utils::clock::{to_chrono, Clock, SharedClock};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: DateTime<Utc>,
    inserted_at: DateTime<Utc>,
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries_count: usize,
    pub expired_cleanups: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

/// Reference data kept across batches, keyed by entity key.
///
/// Expiry is judged against the injected clock; nothing runs in the
/// background, so callers sweep with `evict_expired` between batches.
#[derive(Debug)]
pub struct ReferenceCache<V> {
    clock: SharedClock,
    entries: DashMap<String, CacheEntry<V>>,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    cleanups: AtomicU64,
}

impl<V: Clone> ReferenceCache<V> {
    pub fn new(clock: SharedClock, ttl: Duration, max_entries: usize) -> Self {
        Self {
            clock,
            entries: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            cleanups: AtomicU64::new(0),
        }
    }

    fn normalize(key: &str) -> String {
        key.trim().to_string()
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let key = Self::normalize(key);
        let now = self.clock.now();

        let expired = match self.entries.get(&key) {
            Some(entry) if entry.expires_at > now => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Reference cache hit for key: {}", key);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove(&key);
            self.cleanups.fetch_add(1, Ordering::Relaxed);
            debug!("Removed expired reference entry for key: {}", key);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert(&self, key: &str, value: V) {
        if self.entries.len() >= self.max_entries {
            self.evict_expired();
        }
        if self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }

        let now = self.clock.now();
        self.entries.insert(
            Self::normalize(key),
            CacheEntry {
                value,
                expires_at: now + to_chrono(self.ttl),
                inserted_at: now,
            },
        );
    }

    /// Drop every entry past its TTL; returns how many were removed
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before.saturating_sub(self.entries.len());

        if removed > 0 {
            self.cleanups.fetch_add(removed as u64, Ordering::Relaxed);
            debug!("Cleaned up {} expired reference entries", removed);
        }
        removed
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().inserted_at)
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            self.entries.remove(&key);
            debug!("Evicted oldest reference entry: {}", key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries_count: self.entries.len(),
            expired_cleanups: self.cleanups.load(Ordering::Relaxed),
        }
    }
}
