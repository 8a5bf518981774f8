//! In-memory TTL cache for backend responses
//!
//! Entries expire per TTL class (matched on a substring of the key) and the
//! map is bounded. When full, expired entries are swept first; if that is not
//! enough, the entry stored longest ago is evicted. Eviction follows
//! insertion order, reads do not refresh an entry.
//!
//! Time comes from `tokio::time::Instant` so tests can drive expiry with a
//! paused clock.

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Freshness window for every key containing `pattern`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlClass {
    pub name: String,
    pub pattern: String,
    pub ttl: Duration,
}

impl TtlClass {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            ttl,
        }
    }
}

/// Configuration for the response cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries kept at any time
    pub max_entries: usize,

    /// TTL for keys that match no class
    pub default_ttl: Duration,

    /// Classes checked in order, first match wins
    pub classes: Vec<TtlClass>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            default_ttl: Duration::from_secs(5 * 60),
            classes: vec![
                TtlClass::new("categories", "categories", Duration::from_secs(10 * 60)),
                TtlClass::new("products", "products", Duration::from_secs(2 * 60)),
            ],
        }
    }
}

/// Class name used for keys that match no configured class
pub const DEFAULT_TTL_CLASS: &str = "default";

impl CacheConfig {
    /// Resolve the TTL class for a key
    pub fn classify(&self, key: &str) -> (&str, Duration) {
        self.classes
            .iter()
            .find(|class| key.contains(class.pattern.as_str()))
            .map(|class| (class.name.as_str(), class.ttl))
            .unwrap_or((DEFAULT_TTL_CLASS, self.default_ttl))
    }
}

struct CacheEntry {
    payload: Arc<Value>,
    stored_at: Instant,
    ttl: Duration,
    ttl_class: String,
}

impl CacheEntry {
    fn is_valid(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }
}

#[derive(Default)]
struct CacheInner {
    /// Insertion order == `stored_at` order, front is oldest
    entries: IndexMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl CacheInner {
    fn sweep_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_valid(now));
        let swept = before - self.entries.len();
        self.expirations += swept as u64;
        swept
    }
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    /// Live entry count per TTL class
    pub by_class: BTreeMap<String, usize>,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// Bounded key → payload store with class-based expiry.
///
/// Constructed once per client and shared through `Arc`. None of the
/// operations fail; a missing or expired key is simply `None`.
pub struct ResponseCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Return the payload if present and fresh.
    ///
    /// An expired entry is removed on the spot.
    pub fn get(&self, key: &str) -> Option<Arc<Value>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let fresh = match inner.entries.get(key) {
            Some(entry) if entry.is_valid(now) => Some(Arc::clone(&entry.payload)),
            Some(_) => {
                inner.entries.shift_remove(key);
                inner.expirations += 1;
                trace!(key, "Cache entry expired on read");
                None
            }
            None => None,
        };

        if fresh.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        fresh
    }

    /// Whether a fresh entry exists, without touching hit/miss counters
    pub fn contains_fresh(&self, key: &str) -> bool {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.is_valid(now))
            .unwrap_or(false)
    }

    /// Store a payload under `key`.
    ///
    /// `ttl_override` replaces the class TTL for this entry only. Storing an
    /// existing key refreshes its timestamp.
    pub fn set(&self, key: impl Into<String>, payload: Value, ttl_override: Option<Duration>) {
        self.set_shared(key, Arc::new(payload), ttl_override);
    }

    /// Same as [`ResponseCache::set`] for a payload the caller keeps a handle to
    pub fn set_shared(
        &self,
        key: impl Into<String>,
        payload: Arc<Value>,
        ttl_override: Option<Duration>,
    ) {
        let key = key.into();
        let (class, class_ttl) = self.config.classify(&key);
        let entry = CacheEntry {
            payload,
            stored_at: Instant::now(),
            ttl: ttl_override.unwrap_or(class_ttl),
            ttl_class: class.to_string(),
        };

        if self.config.max_entries == 0 {
            return;
        }

        let mut inner = self.inner.lock();

        // Re-inserting must move the key to the young end
        inner.entries.shift_remove(&key);

        if inner.entries.len() >= self.config.max_entries {
            let swept = inner.sweep_expired(entry.stored_at);
            if swept > 0 {
                debug!(swept, "Swept expired cache entries at capacity");
            }
        }

        while inner.entries.len() >= self.config.max_entries {
            if let Some((evicted, _)) = inner.entries.shift_remove_index(0) {
                inner.evictions += 1;
                debug!(key = %evicted, "Evicted oldest cache entry");
            } else {
                break;
            }
        }

        trace!(key = %key, class = %entry.ttl_class, ttl_ms = entry.ttl.as_millis() as u64, "Cache set");
        inner.entries.insert(key, entry);
    }

    /// Drop one key. Returns whether it was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.lock().entries.shift_remove(key).is_some()
    }

    /// Drop every key containing `pattern`
    pub fn invalidate_matching(&self, pattern: &str) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !key.contains(pattern));
        let removed = before - inner.entries.len();
        if removed > 0 {
            debug!(pattern, removed, "Invalidated cache entries");
        }
        removed
    }

    /// Remove all expired entries now
    pub fn purge_expired(&self) -> usize {
        self.inner.lock().sweep_expired(Instant::now())
    }

    /// Empty the cache (logout / session reset)
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let dropped = inner.entries.len();
        inner.entries.clear();
        debug!(dropped, "Response cache cleared");
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let mut by_class = BTreeMap::new();
        for entry in inner.entries.values() {
            *by_class.entry(entry.ttl_class.clone()).or_insert(0) += 1;
        }

        CacheStats {
            entries: inner.entries.len(),
            max_entries: self.config.max_entries,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            by_class,
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::with_defaults()
    }
}
