//! Background Jobs for the data access layer
//!
//! Periodic tasks owned by [`crate::DbService`]:
//!
//! - `cache_sweep`: deletes expired loader cache entries
//! - `pool_scaling`: runs the scaling controller
//! - `pool_maintenance`: reaps idle connections and tops the pool up to its minimum
//!
//! # Usage
//!
//! ```ignore
//! use medrota_db::jobs::{spawn_job, CacheSweepJob};
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let handle = spawn_job(Arc::new(CacheSweepJob::new(cache, interval)), shutdown_rx);
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! let snapshot = handle.await?;
//! ```

pub mod cache_sweep;
pub mod pool_maintenance;
pub mod pool_scaling;

pub use cache_sweep::CacheSweepJob;
pub use pool_maintenance::PoolMaintenanceJob;
pub use pool_scaling::PoolScalingJob;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::error::DbResult;
use crate::telemetry::metrics::with_metrics;

/// One unit of periodic background work.
#[async_trait]
pub trait PeriodicJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// Errors are logged by the runner and never stop the job.
    async fn run_once(&self) -> DbResult<()>;
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct JobMetrics {
    /// Ticks handled since startup
    pub cycles: AtomicU64,

    /// Ticks that ended in an error
    pub errors: AtomicU64,
}

impl JobMetrics {
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of job metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobSnapshot {
    pub cycles: u64,
    pub errors: u64,
}

// ============================================================================
// RUNNER
// ============================================================================

/// Run `job` every `job.interval()` until the shutdown signal flips to `true`
/// or its sender is dropped. The first run happens one interval after start.
pub async fn periodic_task<J: PeriodicJob>(
    job: Arc<J>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JobSnapshot {
    let metrics = JobMetrics::default();
    if *shutdown_rx.borrow_and_update() {
        tracing::info!(job = job.name(), "Shutdown already signalled, job not started");
        return metrics.snapshot();
    }

    let period = job.interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        job = job.name(),
        interval_ms = period.as_millis() as u64,
        "Background job started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!(job = job.name(), "Background job shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                metrics.cycles.fetch_add(1, Ordering::Relaxed);
                let result = job.run_once().await;
                with_metrics(|m| m.record_job_cycle(job.name(), result.is_ok()));
                if let Err(e) = result {
                    metrics.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(job = job.name(), error = %e, "Background job cycle failed");
                }
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        job = job.name(),
        cycles = snapshot.cycles,
        errors = snapshot.errors,
        "Background job completed"
    );
    snapshot
}

/// Spawn [`periodic_task`] on the current runtime.
pub fn spawn_job<J: PeriodicJob>(
    job: Arc<J>,
    shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<JobSnapshot> {
    tokio::spawn(periodic_task(job, shutdown_rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;

    struct Flaky {
        runs: AtomicU64,
    }

    #[async_trait]
    impl PeriodicJob for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(10)
        }

        async fn run_once(&self) -> DbResult<()> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run % 2 == 1 {
                return Err(DbError::internal("odd run"));
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_survives_errors_and_stops_on_shutdown() {
        let job = Arc::new(Flaky {
            runs: AtomicU64::new(0),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_job(Arc::clone(&job), shutdown_rx);

        tokio::time::sleep(Duration::from_secs(45)).await;
        shutdown_tx.send(true).unwrap();
        let snapshot = handle.await.unwrap();

        assert_eq!(snapshot.cycles, 4);
        assert_eq!(snapshot.errors, 2);

        let mut exported = (0.0, 0.0);
        with_metrics(|m| {
            exported = (
                m.job_cycles_total.with_label_values(&["flaky", "success"]).get(),
                m.job_cycles_total.with_label_values(&["flaky", "error"]).get(),
            );
        });
        assert!(exported.0 >= 2.0 && exported.1 >= 2.0, "{exported:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_stops_when_sender_is_dropped() {
        let job = Arc::new(Flaky {
            runs: AtomicU64::new(0),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_job(job, shutdown_rx);
        drop(shutdown_tx);
        let snapshot = handle.await.unwrap();
        assert_eq!(snapshot.cycles, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_subscribed_after_shutdown_exits_immediately() {
        let (shutdown_tx, _) = watch::channel(false);
        shutdown_tx.send_replace(true);
        let job = Arc::new(Flaky {
            runs: AtomicU64::new(0),
        });
        let handle = spawn_job(Arc::clone(&job), shutdown_tx.subscribe());

        let snapshot = tokio::time::timeout(Duration::from_secs(600), handle)
            .await
            .expect("job should exit without waiting for a change")
            .unwrap();
        assert_eq!(snapshot, JobSnapshot::default());
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
        drop(shutdown_tx);
    }
}
