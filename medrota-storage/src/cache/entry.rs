//! A single cached value and its freshness window.

use std::time::Duration;
use tokio::time::Instant;

/// A cached value with the instant it was stored and how long it stays fresh.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            created_at: Instant::now(),
            ttl,
        }
    }

    /// Instant after which the entry must not be served.
    pub fn expires_at(&self) -> Instant {
        self.created_at + self.ttl
    }

    /// An entry is expired once `created_at + ttl` is strictly in the past.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at() < now
    }

    /// Time since the entry was stored.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}
