//! TTL cache store.
//!
//! A process-local key/value map where every entry carries its own
//! time-to-live. Expired entries are never returned: a read that finds one
//! deletes it on the spot, and [`TtlCache::sweep`] removes the rest in bulk
//! (driven by a periodic job in `medrota-db`).
//!
//! The cache is advisory. Writes are last-write-wins per key and a failed
//! fill (capacity exhausted) leaves any previous value for that key intact.
//!
//! # Example
//!
//! ```ignore
//! let cache: TtlCache<Vec<UserProgress>> = TtlCache::new(CacheStoreConfig::default());
//! cache.insert("user_progress:abc", progress)?;
//! if let Some(hit) = cache.get("user_progress:abc") {
//!     // fresh by construction
//! }
//! ```

pub mod entry;
pub mod stats;
pub mod ttl_cache;

pub use entry::CacheEntry;
pub use stats::CacheStats;
pub use ttl_cache::{CacheStoreConfig, TtlCache};
