//! Periodic scaling evaluation.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::PeriodicJob;
use crate::error::{DbError, DbResult};
use crate::scaling::ScalingController;

/// Runs [`ScalingController::evaluate`] on the controller's evaluation
/// interval. A failed or panicking evaluation is reported as an error and
/// the next tick runs normally.
pub struct PoolScalingJob {
    controller: Arc<ScalingController>,
}

impl PoolScalingJob {
    pub fn new(controller: Arc<ScalingController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl PeriodicJob for PoolScalingJob {
    fn name(&self) -> &'static str {
        "pool_scaling"
    }

    fn interval(&self) -> Duration {
        self.controller.config().evaluation_interval
    }

    async fn run_once(&self) -> DbResult<()> {
        let controller = &self.controller;
        match std::panic::catch_unwind(AssertUnwindSafe(|| controller.evaluate())) {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(DbError::internal("Scaling evaluation panicked")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScalingConfig;
    use crate::jobs::spawn_job;
    use crate::scaling::{PoolSample, ScalablePool};
    use std::sync::Mutex;
    use tokio::sync::watch;

    struct Busy {
        max: Mutex<usize>,
        fail: bool,
    }

    impl ScalablePool for Busy {
        fn sample(&self) -> PoolSample {
            let max = *self.max.lock().unwrap();
            PoolSample {
                utilization: 0.95,
                waiting: 3,
                active: max,
                total: max,
                current_max: max,
                avg_wait: Duration::from_millis(40),
            }
        }

        fn set_max_connections(&self, max: usize) -> DbResult<usize> {
            if self.fail {
                return Err(DbError::PoolClosed);
            }
            *self.max.lock().unwrap() = max;
            Ok(max)
        }
    }

    fn config() -> ScalingConfig {
        ScalingConfig {
            enabled: true,
            min_connections: 2,
            max_connections: 20,
            scale_up_increment: 2,
            evaluation_interval: Duration::from_secs(30),
            min_scale_interval: Duration::from_secs(60),
            ..ScalingConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_scales_up_a_busy_pool() {
        let pool = Arc::new(Busy {
            max: Mutex::new(5),
            fail: false,
        });
        let controller = Arc::new(ScalingController::new(pool.clone(), config()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_job(Arc::new(PoolScalingJob::new(controller)), shutdown_rx);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(*pool.max.lock().unwrap(), 7);

        shutdown_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap().errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_evaluation_is_counted_and_job_continues() {
        let pool = Arc::new(Busy {
            max: Mutex::new(5),
            fail: true,
        });
        let controller = Arc::new(ScalingController::new(pool, config()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_job(Arc::new(PoolScalingJob::new(controller)), shutdown_rx);

        tokio::time::sleep(Duration::from_secs(95)).await;
        shutdown_tx.send(true).unwrap();
        let snapshot = handle.await.unwrap();
        assert_eq!(snapshot.cycles, 3);
        assert!(snapshot.errors >= 1);
    }
}
