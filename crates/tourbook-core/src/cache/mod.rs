//! Bounded, time-boxed LRU cache of recently read records (L1).
//!
//! The cache only smooths bursts of repeated reads within one interaction.
//! It is never a source of truth: writes and pulls invalidate entries, and
//! entries older than the TTL are treated as absent.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::models::{EntityType, RecordId, SyncableRecord};

/// Cache sizing and expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Entries older than this are treated as absent
    pub ttl: Duration,
    /// Maximum number of entries; 0 disables caching
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            capacity: 100,
        }
    }
}

/// Key of a cached record: `<entity_type>:<id>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn record(entity_type: &EntityType, id: &RecordId) -> Self {
        Self(format!("{entity_type}:{id}"))
    }

    /// Prefix matching every record of `entity_type`
    pub fn entity_prefix(entity_type: &EntityType) -> String {
        format!("{entity_type}:")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    hit_count: u64,
    /// Monotonic access stamp; the smallest one is least recently used
    access_tick: u64,
}

#[derive(Debug)]
struct CacheInner<V> {
    entries: HashMap<CacheKey, CacheEntry<V>>,
    tick: u64,
    /// Bumped by every invalidation, hit or miss
    generation: u64,
    hits: u64,
    misses: u64,
}

/// Diagnostics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    /// Mean hit count of live entries
    pub average_hit_count: f64,
}

/// L1 cache of replica records
pub type RecordCache = MemoryCache<SyncableRecord>;

/// Shared LRU + TTL cache handle
#[derive(Debug, Clone)]
pub struct MemoryCache<V> {
    config: CacheConfig,
    inner: Arc<Mutex<CacheInner<V>>>,
}

impl<V: Clone> MemoryCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(CacheInner {
                entries: HashMap::new(),
                tick: 0,
                generation: 0,
                hits: 0,
                misses: 0,
            })),
        }
    }

    pub const fn config(&self) -> CacheConfig {
        self.config
    }

    /// Look up `key`, promoting it to most recently used on a hit
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let now = Instant::now();
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.tick += 1;
        let tick = inner.tick;

        let expired = match inner.entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.inserted_at) < self.config.ttl => {
                entry.hit_count += 1;
                entry.access_tick = tick;
                let value = entry.value.clone();
                inner.hits += 1;
                return Some(value);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.entries.remove(key);
        }
        inner.misses += 1;
        None
    }

    /// Invalidation generation; pass it to [`Self::fill`] after a slow load
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Insert or replace `key`, evicting the least recently used entry when full
    pub fn set(&self, key: CacheKey, value: V) {
        if self.config.capacity == 0 {
            return;
        }
        let mut guard = self.lock();
        Self::insert(&mut guard, &self.config, key, value);
    }

    /// Insert `value` loaded at `generation` unless something was invalidated since
    ///
    /// A writer stores first and invalidates second, so a load that raced a
    /// write sees a newer generation here and is dropped. Returns whether the
    /// value was cached.
    pub fn fill(&self, key: CacheKey, value: V, generation: u64) -> bool {
        if self.config.capacity == 0 {
            return false;
        }
        let mut guard = self.lock();
        if guard.generation != generation {
            return false;
        }
        Self::insert(&mut guard, &self.config, key, value);
        true
    }

    fn insert(inner: &mut CacheInner<V>, config: &CacheConfig, key: CacheKey, value: V) {
        let now = Instant::now();
        let ttl = config.ttl;
        inner.tick += 1;
        let tick = inner.tick;

        if !inner.entries.contains_key(&key) && inner.entries.len() >= config.capacity {
            inner
                .entries
                .retain(|_, entry| now.duration_since(entry.inserted_at) < ttl);
            if inner.entries.len() >= config.capacity {
                let lru_key = inner
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.access_tick)
                    .map(|(key, _)| key.clone());
                if let Some(lru_key) = lru_key {
                    inner.entries.remove(&lru_key);
                }
            }
        }

        inner.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                hit_count: 0,
                access_tick: tick,
            },
        );
    }

    /// Remove `key`; returns whether an entry was present
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.entries.remove(key).is_some()
    }

    /// Remove every entry whose key starts with `prefix`; returns the number removed
    pub fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.lock();
        inner.generation += 1;
        let before = inner.entries.len();
        inner
            .entries
            .retain(|key, _| !key.as_str().starts_with(prefix));
        before - inner.entries.len()
    }

    /// Drop everything (tenant switch)
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let inner = self.lock();
        let live: Vec<&CacheEntry<V>> = inner
            .entries
            .values()
            .filter(|entry| now.duration_since(entry.inserted_at) < self.config.ttl)
            .collect();
        let total_hits: u64 = live.iter().map(|entry| entry.hit_count).sum();
        #[allow(clippy::cast_precision_loss)]
        let average_hit_count = if live.is_empty() {
            0.0
        } else {
            total_hits as f64 / live.len() as f64
        };

        CacheStats {
            size: live.len(),
            capacity: self.config.capacity,
            hits: inner.hits,
            misses: inner.misses,
            average_hit_count,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
