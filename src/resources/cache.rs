//! Result Cache
//!
//! Bounded LRU cache for transformation results, keyed by a SHA-256 digest
//! of the normalized input. Entries may carry a time-to-live.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, trace};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Default number of entries kept before eviction starts.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Computes the cache key of an input value.
///
/// The value is serialized canonically: `serde_json` maps keep their keys
/// sorted, so two objects that differ only in key order hash identically.
pub fn cache_key(input: &Value) -> String {
    let canonical = input.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{:x}", digest)
}

/// A cached value and its bookkeeping.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    /// Serialized size of `value` in bytes
    pub size: usize,
    pub hit_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Monotonic recency stamp; wall-clock ties cannot reorder entries
    #[serde(skip)]
    access_seq: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

/// Counters reported by [`ResultCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Fraction of lookups that hit, 0.0 when nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    clock: u64,
    stats: CacheStats,
}

impl CacheInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn evict_lru(&mut self) -> Option<String> {
        let victim = self
            .entries
            .values()
            .min_by_key(|entry| entry.access_seq)
            .map(|entry| entry.key.clone())?;

        self.entries.remove(&victim);
        self.stats.evictions += 1;
        debug!("Cache evicted {}", short(&victim));
        Some(victim)
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        self.stats.expirations += (before - self.entries.len()) as u64;
    }
}

/// Thread-safe LRU cache of JSON values.
#[derive(Debug)]
pub struct ResultCache {
    capacity: usize,
    ttl: Option<chrono::Duration>,
    inner: Mutex<CacheInner>,
}

impl ResultCache {
    /// Creates a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl: None,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Sets the time-to-live applied to entries inserted afterwards.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = chrono::Duration::from_std(ttl).ok();
        self
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Looks up a value, refreshing its recency on a hit.
    ///
    /// Expired entries are dropped and count as a miss.
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Utc::now();
        let mut inner = self.lock();
        let seq = inner.tick();

        let expired = inner.entries.get(key).map(|entry| entry.is_expired(now));
        let Some(expired) = expired else {
            inner.stats.misses += 1;
            return None;
        };

        if expired {
            inner.entries.remove(key);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            trace!("Cache entry {} expired", short(key));
            return None;
        }

        inner.stats.hits += 1;
        let entry = inner.entries.get_mut(key)?;
        entry.hit_count += 1;
        entry.last_accessed = now;
        entry.access_seq = seq;
        Some(entry.value.clone())
    }

    /// Inserts or replaces a value.
    ///
    /// Inserting a new key into a full cache first evicts the least
    /// recently accessed entry, whose key is returned.
    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<String> {
        let key = key.into();
        let now = Utc::now();
        let expires_at = self.ttl.map(|ttl| now + ttl);
        let size = value.to_string().len();

        let mut inner = self.lock();
        let seq = inner.tick();

        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.value = value;
            entry.size = size;
            entry.last_accessed = now;
            entry.expires_at = expires_at;
            entry.access_seq = seq;
            return None;
        }

        let mut evicted = None;
        if inner.entries.len() >= self.capacity {
            inner.purge_expired(now);
            if inner.entries.len() >= self.capacity {
                evicted = inner.evict_lru();
            }
        }

        inner.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                value,
                size,
                hit_count: 0,
                created_at: now,
                last_accessed: now,
                expires_at,
                access_seq: seq,
            },
        );

        evicted
    }

    /// Returns an entry without touching its recency or the counters.
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.lock().entries.get(key).cloned()
    }

    /// Removes an entry.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.lock().entries.remove(key).map(|entry| entry.value)
    }

    /// Returns true if `key` is present and not expired.
    pub fn contains(&self, key: &str) -> bool {
        let now = Utc::now();
        self.lock()
            .entries
            .get(key)
            .map_or(false, |entry| !entry.is_expired(now))
    }

    /// Number of stored entries, expired ones included until touched.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns true if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total serialized size of the stored values in bytes.
    pub fn total_size(&self) -> usize {
        self.lock().entries.values().map(|entry| entry.size).sum()
    }

    /// Drops every entry; counters are kept.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.entries.len(),
            capacity: self.capacity,
            ..inner.stats
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

fn short(key: &str) -> &str {
    key.get(..12).unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_after_set() {
        let cache = ResultCache::new(4);
        cache.set("a", json!({"pages": 3}));

        assert_eq!(cache.get("a"), Some(json!({"pages": 3})));
        assert_eq!(cache.get("missing"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_no_eviction_at_capacity() {
        let cache = ResultCache::new(2);
        assert_eq!(cache.set("a", json!(1)), None);
        assert_eq!(cache.set("b", json!(2)), None);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_evicts_least_recently_accessed() {
        let cache = ResultCache::new(3);
        cache.set("a", json!(1));
        cache.set("b", json!(2));
        cache.set("c", json!(3));

        // touch a so b becomes the oldest
        cache.get("a");

        assert_eq!(cache.set("d", json!(4)), Some("b".to_string()));
        assert_eq!(cache.len(), 3);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_replace_does_not_evict() {
        let cache = ResultCache::new(2);
        cache.set("a", json!(1));
        cache.set("b", json!(2));

        assert_eq!(cache.set("a", json!(10)), None);
        assert_eq!(cache.get("a"), Some(json!(10)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_hit_count_and_size() {
        let cache = ResultCache::new(2);
        cache.set("k", json!("abc"));
        cache.get("k");
        cache.get("k");

        let entry = cache.peek("k").unwrap();
        assert_eq!(entry.hit_count, 2);
        assert_eq!(entry.size, 5);
        assert_eq!(cache.total_size(), 5);
    }

    #[test]
    fn test_expired_entry_misses() {
        let cache = ResultCache::new(2).with_ttl(Duration::from_millis(20));
        cache.set("k", json!(true));
        assert!(cache.get("k").is_some());

        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_expired_entries_make_room_before_eviction() {
        let cache = ResultCache::new(1).with_ttl(Duration::from_millis(10));
        cache.set("old", json!(1));
        std::thread::sleep(Duration::from_millis(25));

        assert_eq!(cache.set("new", json!(2)), None);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let cache = ResultCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.set("a", json!(1));
        assert_eq!(cache.get("a"), Some(json!(1)));
    }

    #[test]
    fn test_cache_key_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": 2, "x": 3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": {"x": 3, "y": 2}, "b": 1}"#).unwrap();

        assert_eq!(cache_key(&a), cache_key(&b));
        assert_ne!(cache_key(&a), cache_key(&json!({"b": 2})));
    }

    #[test]
    fn test_cache_key_is_sha256_hex() {
        let key = cache_key(&json!("test"));
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_hit_rate() {
        let cache = ResultCache::new(2);
        assert_eq!(cache.stats().hit_rate(), 0.0);

        cache.set("a", json!(1));
        cache.get("a");
        cache.get("b");
        assert!((cache.stats().hit_rate() - 0.5).abs() < f64::EPSILON);
    }
}
