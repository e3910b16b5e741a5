//! Cache statistics.

use serde::{Deserialize, Serialize};

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses (including reads that found an expired entry).
    pub misses: u64,
    /// Number of entries currently in cache, expired or not.
    pub entry_count: u64,
    /// Entries removed because their TTL elapsed (lazily or by sweep).
    pub expirations: u64,
    /// Fills rejected because the cache was at capacity.
    pub rejected_fills: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
