//! Bounded memoizing caches.
//!
//! Every entry carries a freshness hash of the mutable inputs it was computed
//! from. A lookup whose freshly computed hash differs, or whose entry has
//! outlived the TTL, is a miss and evicts the entry, so callers that pass
//! accurate inputs never need to invalidate explicitly.
//!
//! Locking is "fast path read, slow path write": the presence test runs
//! under the read lock, the LRU bump, eviction and insert under a separate
//! write lock. Two threads racing on one key may both compute and store;
//! the later store wins.

pub mod layer;

use lru::LruCache;
use serde::Serialize;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

pub use layer::{CacheLayer, CacheStatsSnapshot};

/// The mutable inputs a cached value depends on, reduced to one digest.
///
/// Parts are labelled and sorted by label before hashing, so the order in
/// which a caller adds them does not matter. Map parts are hashed over
/// their entries sorted by key.
#[derive(Debug, Clone, Default)]
pub struct FreshnessInputs {
    parts: Vec<(&'static str, u64)>,
}

impl FreshnessInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value<T: Hash + ?Sized>(mut self, label: &'static str, value: &T) -> Self {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        self.parts.push((label, hasher.finish()));
        self
    }

    pub fn map(mut self, label: &'static str, map: &HashMap<String, String>) -> Self {
        let mut entries: Vec<(&String, &String)> = map.iter().collect();
        entries.sort_unstable();
        let mut hasher = DefaultHasher::new();
        entries.hash(&mut hasher);
        self.parts.push((label, hasher.finish()));
        self
    }

    pub fn digest(&self) -> u64 {
        let mut parts = self.parts.clone();
        parts.sort_unstable();
        let mut hasher = DefaultHasher::new();
        parts.hash(&mut hasher);
        hasher.finish()
    }
}

/// Counter snapshot for one cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub name: &'static str,
    pub hits: u64,
    pub misses: u64,
    /// Entries dropped to make room.
    pub evictions: u64,
    /// Entries dropped because they were expired or stale.
    pub expired: u64,
    pub size: usize,
    pub capacity: usize,
}

struct Entry<V> {
    value: V,
    inserted: Instant,
    freshness: u64,
}

/// A bounded LRU cache with TTL and freshness checking.
pub struct Cache<K: Hash + Eq, V: Clone> {
    name: &'static str,
    entries: RwLock<LruCache<K, Entry<V>>>,
    ttl: Duration,
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

impl<K: Hash + Eq, V: Clone> Cache<K, V> {
    /// A cache holding at most `capacity` entries. A zero capacity yields a
    /// cache that never stores anything.
    pub fn new(name: &'static str, capacity: usize, ttl: Duration) -> Self {
        Self {
            name,
            entries: RwLock::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            ttl,
            enabled: capacity > 0,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    pub fn disabled(name: &'static str) -> Self {
        Self::new(name, 0, Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn usable(&self, entry: &Entry<V>, freshness: u64) -> bool {
        entry.inserted.elapsed() < self.ttl && entry.freshness == freshness
    }

    /// Look up `key`. Expired or stale entries count as misses and are
    /// removed.
    pub fn get<Q>(&self, key: &Q, inputs: &FreshnessInputs) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if !self.enabled {
            return None;
        }
        let freshness = inputs.digest();

        let found = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries
                .peek(key)
                .map(|entry| self.usable(entry, freshness).then(|| entry.value.clone()))
        };

        match found {
            Some(Some(value)) => {
                self.entries
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .promote(key);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Some(None) => {
                let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
                // Another thread may have refreshed the entry in between.
                if entries.peek(key).is_some_and(|e| !self.usable(e, freshness)) {
                    entries.pop(key);
                    self.expired.fetch_add(1, Ordering::Relaxed);
                    debug!(cache = self.name, "dropped stale entry");
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store `value`, evicting the least recently used entry when full.
    pub fn set(&self, key: K, value: V, inputs: &FreshnessInputs) {
        if !self.enabled {
            return;
        }
        let entry = Entry {
            value,
            inserted: Instant::now(),
            freshness: inputs.digest(),
        };
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !entries.contains(&key) && entries.len() == entries.cap().get() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(cache = self.name, "evicted least recently used entry");
        }
        entries.put(key, entry);
    }

    /// Drop every entry whose key matches `selector`. Returns the count.
    pub fn invalidate(&self, selector: impl Fn(&K) -> bool) -> usize
    where
        K: Clone,
    {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let doomed: Vec<K> = entries
            .iter()
            .filter(|(k, _)| selector(k))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        if !doomed.is_empty() {
            debug!(cache = self.name, removed = doomed.len(), "invalidated entries");
        }
        doomed.len()
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        CacheStats {
            name: self.name,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            size: entries.len(),
            capacity: if self.enabled { entries.cap().get() } else { 0 },
        }
    }
}
