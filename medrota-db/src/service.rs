//! Data access service
//!
//! [`DbService`] is the composition root of the layer: it owns the pool, the
//! loader cache, the batch loader, the batch processor, the optional scaling
//! controller and the background jobs. Construction never connects;
//! [`DbService::start`] warms the pool and spawns the jobs, and
//! [`DbService::shutdown`] stops them and closes the pool.
//!
//! The service is cheap to clone and meant to be shared.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use medrota_core::{
    AnalyticsOptions, CompetencyAnalytics, ProgressOptions, RotationId, RotationOptions,
    RotationOverview, UserId, UserProgress,
};
use medrota_storage::{CacheStats, TtlCache};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::batch::{BatchContext, BatchProcessor};
use crate::config::{BatchConfig, ServiceConfig};
use crate::error::{DbError, DbResult};
use crate::jobs::{spawn_job, CacheSweepJob, JobSnapshot, PoolMaintenanceJob, PoolScalingJob};
use crate::loader::{BatchLoader, CachedResult, RecordSource};
use crate::pool::{
    ConnectionManager, PgManager, Pool, PoolHealth, PoolMetrics, PooledConnection,
};
use crate::scaling::{ScalablePool, ScalingController, ScalingState};

/// Everything `get_metrics` consumers might chart.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceMetrics {
    pub pool: PoolMetrics,
    pub cache: CacheStats,
    /// `None` when scaling is disabled
    pub scaling: Option<ScalingState>,
}

struct ServiceInner<M: ConnectionManager> {
    config: ServiceConfig,
    pool: Pool<M>,
    cache: Arc<TtlCache<CachedResult>>,
    loader: BatchLoader<M>,
    processor: BatchProcessor,
    scaling: Option<Arc<ScalingController>>,
    shutdown_tx: watch::Sender<bool>,
    jobs: Mutex<Vec<JoinHandle<JobSnapshot>>>,
    started: AtomicBool,
}

pub struct DbService<M: ConnectionManager> {
    inner: Arc<ServiceInner<M>>,
}

impl<M: ConnectionManager> Clone for DbService<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ConnectionManager> std::fmt::Debug for DbService<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbService")
            .field("environment", &self.inner.config.environment)
            .field("pool", &self.inner.pool)
            .field("scaling", &self.inner.scaling.is_some())
            .field("started", &self.inner.started.load(Ordering::Relaxed))
            .finish()
    }
}

/// The production service over PostgreSQL.
pub type PgService = DbService<PgManager>;

impl PgService {
    /// Build a not-yet-connected service from `MEDROTA_*` environment
    /// variables.
    pub fn from_env() -> DbResult<Self> {
        let config = ServiceConfig::from_env();
        let manager = PgManager::from_config(&config.database, &config.pool)?;
        Self::new(manager, config)
    }
}

impl<M> DbService<M>
where
    M: ConnectionManager,
    M::Connection: RecordSource,
{
    /// Validate `config` and assemble the service. No connection is opened.
    pub fn new(manager: M, config: ServiceConfig) -> DbResult<Self> {
        config.validate()?;

        let pool = Pool::new(manager, config.pool.clone())?;
        let cache = Arc::new(TtlCache::new(config.cache.store_config()));
        let loader = BatchLoader::new(pool.clone(), Arc::clone(&cache));
        let processor = BatchProcessor::new(config.batch)?;
        let scaling = config.scaling.enabled.then(|| {
            let target: Arc<dyn ScalablePool> = Arc::new(pool.clone());
            Arc::new(ScalingController::new(target, config.scaling.clone()))
        });
        let (shutdown_tx, _) = watch::channel(false);

        tracing::info!(
            environment = ?config.environment,
            min_connections = config.pool.min_connections,
            max_connections = config.pool.max_connections,
            scaling = config.scaling.enabled,
            "Data access service configured"
        );

        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                pool,
                cache,
                loader,
                processor,
                scaling,
                shutdown_tx,
                jobs: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        })
    }

    /// Warm the pool to its minimum and spawn the background jobs.
    ///
    /// Calling it again on a running service is a no-op. Fails with
    /// [`DbError::PoolClosed`] after shutdown.
    pub async fn start(&self) -> DbResult<()> {
        if self.inner.pool.is_closed() {
            return Err(DbError::PoolClosed);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            tracing::debug!("Data access service already started");
            return Ok(());
        }

        let opened = match self.inner.pool.ensure_min().await {
            Ok(opened) => opened,
            Err(e) => {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let config = &self.inner.config;
        let mut handles = vec![
            spawn_job(
                Arc::new(CacheSweepJob::new(
                    Arc::clone(&self.inner.cache),
                    config.cache.sweep_interval,
                )),
                self.inner.shutdown_tx.subscribe(),
            ),
            spawn_job(
                Arc::new(PoolMaintenanceJob::new(
                    self.inner.pool.clone(),
                    config.maintenance_interval,
                )),
                self.inner.shutdown_tx.subscribe(),
            ),
        ];
        if let Some(controller) = &self.inner.scaling {
            handles.push(spawn_job(
                Arc::new(PoolScalingJob::new(Arc::clone(controller))),
                self.inner.shutdown_tx.subscribe(),
            ));
        }
        let jobs = handles.len();
        self.lock_jobs().extend(handles);

        tracing::info!(opened, jobs, "Data access service started");
        Ok(())
    }

    /// Stop the background jobs, wait for them to finish, then close the
    /// pool. Loaned connections are destroyed as they come back.
    pub async fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);

        let handles: Vec<_> = self.lock_jobs().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background job ended abnormally");
            }
        }

        self.inner.pool.close();
        tracing::info!("Data access service shut down");
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<JobSnapshot>>> {
        self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &Pool<M> {
        &self.inner.pool
    }

    pub fn loader(&self) -> &BatchLoader<M> {
        &self.inner.loader
    }

    pub fn processor(&self) -> &BatchProcessor {
        &self.inner.processor
    }

    pub fn scaling(&self) -> Option<&Arc<ScalingController>> {
        self.inner.scaling.as_ref()
    }

    // ------------------------------------------------------------------
    // Pool
    // ------------------------------------------------------------------

    pub async fn acquire(&self) -> DbResult<PooledConnection<M>> {
        self.inner.pool.acquire().await
    }

    pub fn release(&self, conn: PooledConnection<M>) {
        self.inner.pool.release(conn)
    }

    /// Never fails; problems are reported in the returned value.
    pub async fn health_check(&self) -> PoolHealth {
        self.inner.pool.health_check().await
    }

    pub fn get_metrics(&self) -> ServiceMetrics {
        ServiceMetrics {
            pool: self.inner.pool.metrics(),
            cache: self.inner.cache.stats(),
            scaling: self.inner.scaling.as_ref().map(|c| c.state()),
        }
    }

    // ------------------------------------------------------------------
    // Loader
    // ------------------------------------------------------------------

    pub async fn load_user_progress(
        &self,
        user_ids: &[UserId],
        options: &ProgressOptions,
    ) -> DbResult<Vec<UserProgress>> {
        self.inner.loader.load_user_progress(user_ids, options).await
    }

    pub async fn load_competency_analytics(
        &self,
        user_ids: &[UserId],
        options: &AnalyticsOptions,
    ) -> DbResult<Vec<CompetencyAnalytics>> {
        self.inner
            .loader
            .load_competency_analytics(user_ids, options)
            .await
    }

    pub async fn load_rotation_overviews(
        &self,
        rotation_ids: &[RotationId],
        options: &RotationOptions,
    ) -> DbResult<Vec<RotationOverview>> {
        self.inner
            .loader
            .load_rotation_overviews(rotation_ids, options)
            .await
    }

    pub fn invalidate_users(&self, user_ids: &[UserId]) -> usize {
        self.inner.loader.invalidate_users(user_ids)
    }

    pub fn clear_cache(&self) -> usize {
        self.inner.loader.clear_cache()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.loader.cache_stats()
    }

    // ------------------------------------------------------------------
    // Batch processing
    // ------------------------------------------------------------------

    /// Run `processor` over `items` in bounded waves. `config` overrides the
    /// service's batch settings for this call only.
    pub async fn process_batches<T, R, E, F, Fut>(
        &self,
        items: Vec<T>,
        processor: F,
        config: Option<BatchConfig>,
    ) -> Result<Vec<R>, E>
    where
        F: Fn(Vec<T>, BatchContext) -> Fut,
        Fut: Future<Output = Result<Vec<R>, E>>,
        E: std::fmt::Display + From<DbError>,
    {
        match config {
            None => self.inner.processor.process(items, processor).await,
            Some(config) => {
                let custom = BatchProcessor::new(config).map_err(E::from)?;
                custom.process(items, processor).await
            }
        }
    }
}
