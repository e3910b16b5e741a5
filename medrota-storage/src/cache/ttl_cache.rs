//! Concurrent TTL cache backed by `DashMap`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use medrota_core::CacheError;
use tokio::time::Instant;

use super::entry::CacheEntry;
use super::stats::CacheStats;

/// Configuration for the TTL cache store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStoreConfig {
    /// TTL applied by [`TtlCache::insert`].
    pub default_ttl: Duration,
    /// Soft upper bound on the number of entries.
    pub max_entries: usize,
}

impl Default for CacheStoreConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300), // 5 minutes
            max_entries: 10_000,
        }
    }
}

impl CacheStoreConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default entry TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the max entries.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }
}

/// Process-local key/value store with per-entry TTL.
///
/// Reads never return an entry whose `created_at + ttl` is in the past.
/// `max_entries` is a soft limit: concurrent fills racing past the check can
/// overshoot it by the number of racing writers.
#[derive(Debug)]
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    config: CacheStoreConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    rejected_fills: AtomicU64,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(config: CacheStoreConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            rejected_fills: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheStoreConfig {
        &self.config
    }

    /// Fetch a fresh value, deleting the entry if it has expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        // The read guard must be released before remove_if takes the shard
        // write lock.
        let lookup = self
            .entries
            .get(key)
            .map(|entry| (!entry.is_expired(now)).then(|| entry.value.clone()));

        match lookup {
            Some(Some(value)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Some(None) => {
                if self
                    .entries
                    .remove_if(key, |_, entry| entry.is_expired(now))
                    .is_some()
                {
                    self.expirations.fetch_add(1, Ordering::Relaxed);
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

    /// Store a value under the default TTL.
    pub fn insert(&self, key: impl Into<String>, value: V) -> Result<(), CacheError> {
        self.insert_with_ttl(key, value, self.config.default_ttl)
    }

    /// Store a value with an explicit TTL, overwriting any existing entry.
    ///
    /// Overwrites always succeed. A new key is rejected when the cache is
    /// full even after expired entries have been swept.
    pub fn insert_with_ttl(
        &self,
        key: impl Into<String>,
        value: V,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = key.into();
        if !self.entries.contains_key(&key) && self.entries.len() >= self.config.max_entries {
            self.sweep();
            if self.entries.len() >= self.config.max_entries {
                self.rejected_fills.fetch_add(1, Ordering::Relaxed);
                return Err(CacheError::CapacityExceeded {
                    capacity: self.config.max_entries,
                });
            }
        }
        self.entries.insert(key, CacheEntry::new(value, ttl));
        Ok(())
    }

    /// Remove a single key. Returns whether an entry was present.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every key starting with `prefix`, returning how many were dropped.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        before.saturating_sub(self.entries.len())
    }

    /// Drop all entries, returning how many there were.
    pub fn clear(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Delete every expired entry, returning the number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0usize;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!(removed, remaining = self.entries.len(), "Swept expired cache entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.entries.len() as u64,
            expirations: self.expirations.load(Ordering::Relaxed),
            rejected_fills: self.rejected_fills.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cache(ttl_secs: u64, max: usize) -> TtlCache<u32> {
        TtlCache::new(
            CacheStoreConfig::new()
                .with_ttl(Duration::from_secs(ttl_secs))
                .with_max_entries(max),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_returns_fresh_value_and_counts_hit() {
        let cache = cache(60, 10);
        cache.insert("k", 7).unwrap();
        assert_eq!(cache.get("k"), Some(7));
        assert_eq!(cache.get("missing"), None);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_deleted_on_read() {
        let cache = cache(60, 10);
        cache.insert("k", 1).unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_still_served_at_exact_ttl() {
        let cache = cache(60, 10);
        cache.insert("k", 1).unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(cache.get("k"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_only_removes_expired() {
        let cache = cache(60, 10);
        cache.insert("old", 1).unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        cache
            .insert_with_ttl("young", 2, Duration::from_secs(120))
            .unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.get("young"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cache_rejects_new_keys_but_allows_overwrite() {
        let cache = cache(60, 2);
        cache.insert("a", 1).unwrap();
        cache.insert("b", 2).unwrap();
        assert_eq!(
            cache.insert("c", 3),
            Err(CacheError::CapacityExceeded { capacity: 2 })
        );
        cache.insert("a", 10).unwrap();
        assert_eq!(cache.get("a"), Some(10));
        assert_eq!(cache.stats().rejected_fills, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cache_makes_room_by_sweeping_expired() {
        let cache = cache(10, 1);
        cache.insert("a", 1).unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        cache.insert("b", 2).unwrap();
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_prefix_and_clear() {
        let cache = cache(60, 10);
        cache.insert("user_progress:1", 1).unwrap();
        cache.insert("user_progress:2", 2).unwrap();
        cache.insert("rotation_overview:1", 3).unwrap();
        assert_eq!(cache.remove_prefix("user_progress:"), 2);
        assert!(cache.remove("rotation_overview:1"));
        assert!(!cache.remove("rotation_overview:1"));
        cache.insert("x", 4).unwrap();
        assert_eq!(cache.clear(), 1);
        assert!(cache.is_empty());
    }

    proptest! {
        #[test]
        fn prop_last_write_wins(values in proptest::collection::vec(any::<u32>(), 1..20)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            rt.block_on(async {
                let cache = cache(60, 4);
                for v in &values {
                    cache.insert("key", *v).unwrap();
                }
                prop_assert_eq!(cache.get("key"), values.last().copied());
                prop_assert_eq!(cache.len(), 1);
                Ok(())
            })?;
        }
    }
}
