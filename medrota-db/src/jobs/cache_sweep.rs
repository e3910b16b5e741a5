//! Periodic deletion of expired cache entries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use medrota_storage::TtlCache;

use super::PeriodicJob;
use crate::error::DbResult;

pub struct CacheSweepJob<V> {
    cache: Arc<TtlCache<V>>,
    interval: Duration,
}

impl<V> CacheSweepJob<V> {
    pub fn new(cache: Arc<TtlCache<V>>, interval: Duration) -> Self {
        Self { cache, interval }
    }
}

#[async_trait]
impl<V> PeriodicJob for CacheSweepJob<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        "cache_sweep"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> DbResult<()> {
        let removed = self.cache.sweep();
        if removed > 0 {
            tracing::debug!(removed, remaining = self.cache.len(), "Swept expired cache entries");
        }
        Ok(())
    }
}
