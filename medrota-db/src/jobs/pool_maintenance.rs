//! Idle reaping and minimum top-up for the connection pool.

use std::time::Duration;

use async_trait::async_trait;

use super::PeriodicJob;
use crate::error::DbResult;
use crate::pool::{ConnectionManager, Pool};

pub struct PoolMaintenanceJob<M: ConnectionManager> {
    pool: Pool<M>,
    interval: Duration,
}

impl<M: ConnectionManager> PoolMaintenanceJob<M> {
    pub fn new(pool: Pool<M>, interval: Duration) -> Self {
        Self { pool, interval }
    }
}

#[async_trait]
impl<M: ConnectionManager> PeriodicJob for PoolMaintenanceJob<M> {
    fn name(&self) -> &'static str {
        "pool_maintenance"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> DbResult<()> {
        if self.pool.is_closed() {
            return Ok(());
        }
        let reaped = self.pool.reap_idle();
        let opened = self.pool.ensure_min().await?;
        if reaped > 0 || opened > 0 {
            tracing::debug!(reaped, opened, "Pool maintenance cycle");
        }
        Ok(())
    }
}
