//! TTL + priority cache for query results
//!
//! Entries are keyed by the canonical query shape and carry the class-derived
//! TTL, an eviction priority, and the invalidation pattern set computed once
//! at insertion. A reverse index (pattern → keys) makes write invalidation a
//! set intersection instead of a scan.
//!
//! # Eviction
//!
//! When occupancy reaches `max_entries`, entries are scored
//! `age_since_last_access + 1/(access_count+1) − 0.5 × priority` and the
//! highest scores are dropped until occupancy is back to ~90% of the bound.
//! Candidates with a higher priority than the incoming entry are skipped, so
//! a burst of low-value entries cannot flush identity lookups; occupancy may
//! therefore exceed `max_entries`. A hard ceiling (default `max_entries +
//! 25%`) forces the same eviction without priority protection.
//!
//! All state lives behind one `parking_lot::Mutex`; critical sections are
//! short and never reach an await point.

use crate::cache::key::CacheKey;
use crate::cache::patterns::{patterns_for_read, patterns_for_write};
use crate::cache::policy::{CacheClass, CachePolicy};
use crate::types::QueryShape;
use bson::Document;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

// ============================================================================
// Configuration
// ============================================================================

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Master switch; a disabled cache is inert
    pub enabled: bool,
    /// Soft occupancy bound that triggers priority-respecting eviction
    pub max_entries: usize,
    /// Hard ceiling that triggers forced eviction; `None` derives
    /// `max_entries + max_entries/4`
    pub hard_max_entries: Option<usize>,
    /// Interval of the background expiry sweep
    pub sweep_interval: Duration,
    /// Per-class TTL overrides
    pub ttl_overrides: HashMap<CacheClass, Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 5_000,
            hard_max_entries: None,
            sweep_interval: Duration::from_secs(60),
            ttl_overrides: HashMap::new(),
        }
    }
}

impl CacheConfig {
    /// Set the soft occupancy bound
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Set an explicit hard ceiling
    pub fn with_hard_max_entries(mut self, hard_max: usize) -> Self {
        self.hard_max_entries = Some(hard_max);
        self
    }

    /// Set the sweep interval
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Override one class's TTL
    pub fn with_ttl_override(mut self, class: CacheClass, ttl: Duration) -> Self {
        self.ttl_overrides.insert(class, ttl);
        self
    }

    /// Disable the cache entirely
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Effective hard ceiling
    pub fn effective_hard_max(&self) -> usize {
        self.hard_max_entries
            .unwrap_or(self.max_entries + self.max_entries / 4)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_entries == 0 {
            return Err("cache max_entries must be at least 1".to_string());
        }
        if self.effective_hard_max() < self.max_entries {
            return Err("cache hard_max_entries must not be below max_entries".to_string());
        }
        if self.sweep_interval < Duration::from_millis(1) {
            return Err("cache sweep_interval must be positive".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Values and entries
// ============================================================================

/// A cached operation result
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    /// Result of a single-document lookup
    One(Option<Document>),
    /// Result of a find or aggregation
    Many(Vec<Document>),
    /// Result of a count
    Count(u64),
}

impl CachedValue {
    /// Empty results are never cached
    pub fn is_empty(&self) -> bool {
        match self {
            CachedValue::One(v) => v.is_none(),
            CachedValue::Many(v) => v.is_empty(),
            CachedValue::Count(n) => *n == 0,
        }
    }
}

struct CacheEntry {
    value: CachedValue,
    priority: u8,
    collection: String,
    patterns: BTreeSet<String>,
    created_at: Instant,
    ttl: Duration,
    last_accessed: Instant,
    access_count: u64,
}

impl CacheEntry {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) > self.ttl
    }

    fn score(&self, now: Instant) -> f64 {
        let age = now.duration_since(self.last_accessed).as_secs_f64();
        age + 1.0 / (self.access_count as f64 + 1.0) - 0.5 * self.priority as f64
    }
}

// ============================================================================
// Stats
// ============================================================================

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    skipped_empty: AtomicU64,
    evictions: AtomicU64,
    forced_evictions: AtomicU64,
    expired: AtomicU64,
    invalidated: AtomicU64,
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Current occupancy
    pub entries: usize,
    /// Configured soft bound
    pub max_entries: usize,
    /// Lookup hits
    pub hits: u64,
    /// Lookup misses (including expired entries)
    pub misses: u64,
    /// Hit rate over all lookups
    pub hit_rate: f64,
    /// Entries stored
    pub inserts: u64,
    /// Empty results refused
    pub skipped_empty: u64,
    /// Entries evicted under the soft bound
    pub evictions: u64,
    /// Entries evicted by the hard ceiling
    pub forced_evictions: u64,
    /// Entries dropped because their TTL lapsed
    pub expired: u64,
    /// Entries removed by invalidation or clear
    pub invalidated: u64,
}

// ============================================================================
// Cache
// ============================================================================

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    by_pattern: HashMap<String, HashSet<CacheKey>>,
    by_collection: HashMap<String, HashSet<CacheKey>>,
}

/// Query result cache with pattern invalidation
pub struct QueryCache {
    config: CacheConfig,
    policy: CachePolicy,
    state: Mutex<CacheState>,
    counters: Counters,
}

impl QueryCache {
    /// Cache with the given configuration
    pub fn new(config: CacheConfig) -> Self {
        let policy = CachePolicy::with_overrides(config.ttl_overrides.clone());
        Self {
            config,
            policy,
            state: Mutex::new(CacheState::default()),
            counters: Counters::default(),
        }
    }

    /// Configured sweep interval, used by the facade's sweep task
    pub fn sweep_interval(&self) -> Duration {
        self.config.sweep_interval
    }

    /// Look up a shape; a hit refreshes its LRU metadata
    pub fn get(&self, shape: &QueryShape) -> Option<CachedValue> {
        if !self.config.enabled {
            return None;
        }
        let key = CacheKey::from_shape(shape);
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired = match state.entries.get(&key) {
            Some(entry) => entry.expired(now),
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if expired {
            Self::detach(&mut state, key);
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let entry = state.entries.get_mut(&key).unwrap();
        entry.last_accessed = now;
        entry.access_count += 1;
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    /// Store a result under its shape's key
    ///
    /// Empty results are refused. Inserting over an existing key replaces the
    /// entry and refreshes its TTL.
    pub fn set(&self, shape: &QueryShape, value: CachedValue) {
        let class = self.policy.classify(shape);
        self.insert_with_ttl(shape, value, self.policy.ttl_for(class), class);
    }

    /// Store a result with an explicit TTL instead of the class TTL
    ///
    /// Eviction priority still follows the shape's class.
    pub fn set_with_ttl(&self, shape: &QueryShape, value: CachedValue, ttl: Duration) {
        let class = self.policy.classify(shape);
        self.insert_with_ttl(shape, value, ttl, class);
    }

    fn insert_with_ttl(&self, shape: &QueryShape, value: CachedValue, ttl: Duration, class: CacheClass) {
        if !self.config.enabled {
            return;
        }
        if value.is_empty() {
            self.counters.skipped_empty.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let priority = class.priority();
        tracing::trace!(
            collection = %shape.collection,
            class = class.as_str(),
            "caching result"
        );
        let entry = CacheEntry {
            value,
            priority,
            collection: shape.collection.clone(),
            patterns: patterns_for_read(&shape.collection, &shape.filter),
            created_at: Instant::now(),
            ttl,
            last_accessed: Instant::now(),
            access_count: 0,
        };
        let key = CacheKey::from_shape(shape);
        let now = entry.created_at;

        let mut state = self.state.lock();
        if state.entries.contains_key(&key) {
            Self::detach(&mut state, key);
        } else {
            let target = self.config.max_entries * 9 / 10;
            if state.entries.len() >= self.config.effective_hard_max() {
                let evicted = Self::evict(&mut state, now, None, target);
                self.counters
                    .forced_evictions
                    .fetch_add(evicted, Ordering::Relaxed);
            } else if state.entries.len() >= self.config.max_entries {
                let evicted = Self::evict(&mut state, now, Some(priority), target);
                self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
            }
        }

        for pattern in &entry.patterns {
            state
                .by_pattern
                .entry(pattern.clone())
                .or_default()
                .insert(key);
        }
        state
            .by_collection
            .entry(entry.collection.clone())
            .or_default()
            .insert(key);
        state.entries.insert(key, entry);
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop every entry whose pattern set intersects the write's patterns
    pub fn invalidate_for_write(
        &self,
        collection: &str,
        filter: &Document,
        update: Option<&Document>,
    ) -> usize {
        let patterns = patterns_for_write(collection, filter, update);
        self.invalidate_patterns(&patterns)
    }

    /// Drop every entry indexed under any of `patterns`
    pub fn invalidate_patterns(&self, patterns: &BTreeSet<String>) -> usize {
        if !self.config.enabled {
            return 0;
        }
        let mut state = self.state.lock();
        let mut victims: HashSet<CacheKey> = HashSet::new();
        for pattern in patterns {
            if let Some(keys) = state.by_pattern.get(pattern) {
                victims.extend(keys.iter().copied());
            }
        }
        let removed = victims.len();
        for key in victims {
            Self::detach(&mut state, key);
        }
        self.counters
            .invalidated
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drop every entry cached for `collection`
    pub fn invalidate_collection(&self, collection: &str) -> usize {
        let mut state = self.state.lock();
        let victims: Vec<CacheKey> = state
            .by_collection
            .get(collection)
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default();
        let removed = victims.len();
        for key in victims {
            Self::detach(&mut state, key);
        }
        self.counters
            .invalidated
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drop everything
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let removed = state.entries.len();
        state.entries.clear();
        state.by_pattern.clear();
        state.by_collection.clear();
        self.counters
            .invalidated
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drop TTL-expired entries; called by the background sweep task
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let victims: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(_, e)| e.expired(now))
            .map(|(k, _)| *k)
            .collect();
        let removed = victims.len();
        for key in victims {
            Self::detach(&mut state, key);
        }
        self.counters
            .expired
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Current occupancy
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Statistics snapshot
    pub fn stats(&self) -> CacheStats {
        let entries = self.state.lock().entries.len();
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            entries,
            max_entries: self.config.max_entries,
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            skipped_empty: self.counters.skipped_empty.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            forced_evictions: self.counters.forced_evictions.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            invalidated: self.counters.invalidated.load(Ordering::Relaxed),
        }
    }

    fn detach(state: &mut CacheState, key: CacheKey) {
        let entry = match state.entries.remove(&key) {
            Some(e) => e,
            None => return,
        };
        for pattern in &entry.patterns {
            if let Some(bucket) = state.by_pattern.get_mut(pattern) {
                bucket.remove(&key);
                if bucket.is_empty() {
                    state.by_pattern.remove(pattern);
                }
            }
        }
        if let Some(bucket) = state.by_collection.get_mut(&entry.collection) {
            bucket.remove(&key);
            if bucket.is_empty() {
                state.by_collection.remove(&entry.collection);
            }
        }
    }

    /// Evict highest-scoring candidates until occupancy is at `target`
    ///
    /// `protect_above` skips entries with a priority strictly greater than
    /// the given one; `None` considers everything.
    fn evict(state: &mut CacheState, now: Instant, protect_above: Option<u8>, target: usize) -> u64 {
        let mut candidates: Vec<(CacheKey, f64)> = state
            .entries
            .iter()
            .filter(|(_, e)| protect_above.map_or(true, |p| e.priority <= p))
            .map(|(k, e)| (*k, e.score(now)))
            .collect();
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let mut evicted = 0;
        for (key, _) in candidates {
            if state.entries.len() <= target {
                break;
            }
            Self::detach(state, key);
            evicted += 1;
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FindOptions;
    use bson::doc;
    use std::thread;

    fn shape_for_user(user: i32) -> QueryShape {
        QueryShape::find_one("users", doc! { "user_id": user })
    }

    fn one(user: i32) -> CachedValue {
        CachedValue::One(Some(doc! { "user_id": user, "name": format!("u{}", user) }))
    }

    #[test]
    fn test_roundtrip_and_counters() {
        let cache = QueryCache::new(CacheConfig::default());
        let shape = shape_for_user(7);
        assert!(cache.get(&shape).is_none());
        cache.set(&shape, one(7));
        assert_eq!(cache.get(&shape), Some(one(7)));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_logically_identical_shapes_share_one_entry() {
        let cache = QueryCache::new(CacheConfig::default());
        let a = QueryShape::find_one("users", doc! { "user_id": 7, "active": true });
        let b = QueryShape::find_one("users", doc! { "active": true, "user_id": 7 });
        cache.set(&a, one(7));
        cache.set(&b, one(7));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&a), Some(one(7)));
        assert_eq!(cache.get(&b), Some(one(7)));
    }

    #[test]
    fn test_empty_results_are_refused() {
        let cache = QueryCache::new(CacheConfig::default());
        cache.set(&shape_for_user(1), CachedValue::One(None));
        cache.set(&shape_for_user(2), CachedValue::Many(Vec::new()));
        cache.set(&shape_for_user(3), CachedValue::Count(0));
        assert!(cache.is_empty());
        assert_eq!(cache.stats().skipped_empty, 3);
    }

    #[test]
    fn test_ttl_expiry() {
        let config = CacheConfig::default()
            .with_ttl_override(CacheClass::Identity, Duration::from_millis(25));
        let cache = QueryCache::new(config);
        let shape = shape_for_user(7);
        cache.set(&shape, one(7));
        assert!(cache.get(&shape).is_some());
        thread::sleep(Duration::from_millis(60));
        assert!(cache.get(&shape).is_none());
        assert_eq!(cache.stats().expired, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_sweep_removes_expired_entries() {
        let config = CacheConfig::default()
            .with_ttl_override(CacheClass::Identity, Duration::from_millis(25));
        let cache = QueryCache::new(config);
        for user in 0..4 {
            cache.set(&shape_for_user(user), one(user));
        }
        assert_eq!(cache.sweep(), 0);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.sweep(), 4);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_targeted_invalidation_spares_other_entities() {
        let cache = QueryCache::new(CacheConfig::default());
        cache.set(&shape_for_user(7), one(7));
        cache.set(&shape_for_user(8), one(8));

        let removed = cache.invalidate_for_write(
            "users",
            &doc! { "user_id": 7 },
            Some(&doc! { "$set": { "name": "renamed" } }),
        );
        assert_eq!(removed, 1);
        assert!(cache.get(&shape_for_user(7)).is_none());
        assert!(cache.get(&shape_for_user(8)).is_some());
    }

    #[test]
    fn test_identity_invalidation_crosses_collections() {
        let cache = QueryCache::new(CacheConfig::default());
        let messages = QueryShape::find(
            "messages",
            doc! { "user_id": 7 },
            &FindOptions::new().limit(50),
        );
        cache.set(&messages, CachedValue::Many(vec![doc! { "user_id": 7 }]));

        let removed =
            cache.invalidate_for_write("users", &doc! { "user_id": 7 }, Some(&doc! { "$set": { "name": "x" } }));
        assert_eq!(removed, 1);
        assert!(cache.get(&messages).is_none());
    }

    #[test]
    fn test_broad_write_clears_whole_collection() {
        let cache = QueryCache::new(CacheConfig::default());
        let targeted = QueryShape::find("messages", doc! { "user_id": 7 }, &FindOptions::new());
        let broad = QueryShape::find("messages", doc! {}, &FindOptions::new().limit(50));
        cache.set(&targeted, CachedValue::Many(vec![doc! { "user_id": 7 }]));
        cache.set(&broad, CachedValue::Many(vec![doc! { "x": 1 }]));
        cache.set(&shape_for_user(7), one(7));

        let removed = cache.invalidate_for_write("messages", &doc! { "flagged": true }, None);
        assert_eq!(removed, 2);
        // The users entry survives a broad messages write
        assert!(cache.get(&shape_for_user(7)).is_some());
    }

    #[test]
    fn test_invalidate_collection_and_clear() {
        let cache = QueryCache::new(CacheConfig::default());
        cache.set(&shape_for_user(1), one(1));
        cache.set(
            &QueryShape::find("messages", doc! { "channel_id": 2 }, &FindOptions::new()),
            CachedValue::Many(vec![doc! { "m": 1 }]),
        );
        assert_eq!(cache.invalidate_collection("messages"), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.clear(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_soft_eviction_shrinks_to_ninety_percent() {
        let config = CacheConfig::default().with_max_entries(100);
        let cache = QueryCache::new(config);
        for user in 0..100 {
            cache.set(&shape_for_user(user), one(user));
        }
        assert_eq!(cache.len(), 100);
        cache.set(&shape_for_user(100), one(100));
        assert_eq!(cache.len(), 91);
        assert_eq!(cache.stats().evictions, 10);
    }

    #[test]
    fn test_eviction_prefers_least_recently_used() {
        let config = CacheConfig::default().with_max_entries(10);
        let cache = QueryCache::new(config);
        for user in 0..10 {
            cache.set(&shape_for_user(user), one(user));
        }
        // Touch the first few so their scores drop
        for user in 0..5 {
            cache.get(&shape_for_user(user));
            cache.get(&shape_for_user(user));
        }
        cache.set(&shape_for_user(10), one(10));
        for user in 0..5 {
            assert!(
                cache.get(&shape_for_user(user)).is_some(),
                "hot entry {} was evicted",
                user
            );
        }
    }

    #[test]
    fn test_priority_protection_then_hard_ceiling() {
        let config = CacheConfig::default()
            .with_max_entries(4)
            .with_hard_max_entries(5);
        let cache = QueryCache::new(config);
        // Identity entries carry the top priority
        for user in 0..4 {
            cache.set(&shape_for_user(user), one(user));
        }
        let presence = |n: i32| QueryShape::find_one("presence", doc! { "user_id": n });
        let beat = |n: i32| CachedValue::One(Some(doc! { "user_id": n, "online": true }));

        // Soft eviction finds no candidate at or below presence priority, so
        // the entry is admitted over the bound
        cache.set(&presence(100), beat(100));
        assert_eq!(cache.len(), 5);
        assert_eq!(cache.stats().evictions, 0);

        // At the hard ceiling priority protection no longer applies
        cache.set(&presence(101), beat(101));
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.stats().forced_evictions, 2);
    }

    #[test]
    fn test_disabled_cache_is_inert() {
        let cache = QueryCache::new(CacheConfig::default().disabled());
        let shape = shape_for_user(7);
        cache.set(&shape, one(7));
        assert!(cache.get(&shape).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(CacheConfig::default().validate().is_ok());
        assert!(CacheConfig::default()
            .with_max_entries(0)
            .validate()
            .is_err());
        assert!(CacheConfig::default()
            .with_max_entries(100)
            .with_hard_max_entries(50)
            .validate()
            .is_err());
    }

    #[test]
    fn test_overwrite_refreshes_entry() {
        let cache = QueryCache::new(CacheConfig::default());
        let shape = shape_for_user(7);
        cache.set(&shape, one(7));
        cache.set(
            &shape,
            CachedValue::One(Some(doc! { "user_id": 7, "name": "renamed" })),
        );
        assert_eq!(cache.len(), 1);
        match cache.get(&shape) {
            Some(CachedValue::One(Some(d))) => assert_eq!(d.get_str("name").unwrap(), "renamed"),
            other => panic!("unexpected cached value: {:?}", other),
        }
    }
}
