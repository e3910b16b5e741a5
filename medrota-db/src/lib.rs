//! Medrota DB - Data Access Layer
//!
//! A self-scaling PostgreSQL connection pool coupled with a batch loader
//! that removes N+1 query patterns, a bounded batch processor, and a TTL
//! cache over the analytics views.
//!
//! Start from [`DbService`] (or [`PgService::from_env`]); the individual
//! components are public for callers that compose them differently.

pub mod batch;
pub mod config;
pub mod constants;
pub mod error;
pub mod jobs;
pub mod loader;
pub mod pool;
pub mod scaling;
pub mod service;
pub mod telemetry;

pub use batch::{
    BatchContext, BatchProcessor, BatchProgress, BatchSizer, FixedBatchSize, PressureAwareSizer,
};
pub use config::{
    BatchConfig, CacheConfig, DbConfig, Environment, PoolConfig, ScalingConfig, ServiceConfig,
    SessionGuards,
};
pub use error::{DbError, DbResult, ErrorCode};
pub use jobs::{spawn_job, JobSnapshot, PeriodicJob};
pub use loader::{BatchLoader, CacheKey, CachedResult, LoadOperation, RecordSource};
pub use pool::{
    ConnectionManager, PgConnection, PgManager, Pool, PoolHealth, PoolMetrics, PooledConnection,
};
pub use scaling::{
    decide, PoolSample, ScalablePool, ScalingController, ScalingDecision, ScalingState,
};
pub use service::{DbService, PgService, ServiceMetrics};
pub use telemetry::{encode_metrics, init_tracing, TelemetryConfig};
