//! Medrota Storage
//!
//! Process-local storage primitives used by the data access layer. Today that
//! is the TTL cache store in [`cache`]; the relational backend itself lives
//! behind the pool in `medrota-db`.

pub mod cache;

pub use cache::{CacheEntry, CacheStats, CacheStoreConfig, TtlCache};
