//! Prometheus Metrics Definitions
//!
//! Collectors are registered once with the default registry. Recording is
//! best-effort: callers go through [`with_metrics`] and skip silently when
//! registration failed.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

use crate::error::{DbError, DbResult};

/// Acquire wait buckets (seconds)
/// Covers: 0.1ms, 1ms, 5ms, 10ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
const WAIT_BUCKETS: &[f64] = &[
    0.0001, 0.001, 0.005, 0.010, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0,
];

/// Query latency buckets (seconds)
const QUERY_LATENCY_BUCKETS: &[f64] =
    &[0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 30.0];

/// Global metrics instance - initialized on first use
pub static METRICS: Lazy<DbResult<DbMetrics>> = Lazy::new(DbMetrics::new);

/// Run `f` against the global metrics if they registered successfully.
pub(crate) fn with_metrics(f: impl FnOnce(&DbMetrics)) {
    if let Ok(metrics) = METRICS.as_ref() {
        f(metrics);
    }
}

/// Container for all data access metrics.
#[derive(Clone)]
pub struct DbMetrics {
    /// Acquire wait histogram - labels: outcome (acquired/timeout)
    pub pool_acquire_wait_seconds: HistogramVec,

    /// Connection lifecycle counter - labels: event (created, max_uses, broken, over_max, idle, closed)
    pub pool_connection_events_total: CounterVec,

    /// Current pool ceiling as set by the scaling controller
    pub pool_max_connections: Gauge,

    /// Applied scaling actions - labels: direction (up/down)
    pub scaling_actions_total: CounterVec,

    /// Loader round trips - labels: operation, relation, status
    pub loader_queries_total: CounterVec,

    /// Loader query latency - labels: operation, relation
    pub loader_query_duration_seconds: HistogramVec,

    /// Loader cache lookups - labels: operation, result (hit/miss)
    pub loader_cache_lookups_total: CounterVec,

    /// Batch processor chunks - labels: status
    pub batch_chunks_total: CounterVec,

    /// Background job cycles - labels: job, status
    pub job_cycles_total: CounterVec,
}

impl DbMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> DbResult<Self> {
        Ok(Self {
            pool_acquire_wait_seconds: register_histogram_vec!(
                "medrota_pool_acquire_wait_seconds",
                "Time spent waiting for a pooled connection",
                &["outcome"],
                WAIT_BUCKETS.to_vec()
            )
            .map_err(|e| DbError::internal(format!("Failed to register pool_acquire_wait_seconds: {}", e)))?,

            pool_connection_events_total: register_counter_vec!(
                "medrota_pool_connection_events_total",
                "Pooled connections created and destroyed",
                &["event"]
            )
            .map_err(|e| DbError::internal(format!("Failed to register pool_connection_events_total: {}", e)))?,

            pool_max_connections: register_gauge!(
                "medrota_pool_max_connections",
                "Current connection pool ceiling"
            )
            .map_err(|e| DbError::internal(format!("Failed to register pool_max_connections: {}", e)))?,

            scaling_actions_total: register_counter_vec!(
                "medrota_scaling_actions_total",
                "Pool ceiling changes applied by the scaling controller",
                &["direction"]
            )
            .map_err(|e| DbError::internal(format!("Failed to register scaling_actions_total: {}", e)))?,

            loader_queries_total: register_counter_vec!(
                "medrota_loader_queries_total",
                "Round trips issued by the batch loader",
                &["operation", "relation", "status"]
            )
            .map_err(|e| DbError::internal(format!("Failed to register loader_queries_total: {}", e)))?,

            loader_query_duration_seconds: register_histogram_vec!(
                "medrota_loader_query_duration_seconds",
                "Batch loader query duration in seconds",
                &["operation", "relation"],
                QUERY_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| DbError::internal(format!("Failed to register loader_query_duration_seconds: {}", e)))?,

            loader_cache_lookups_total: register_counter_vec!(
                "medrota_loader_cache_lookups_total",
                "Batch loader cache lookups",
                &["operation", "result"]
            )
            .map_err(|e| DbError::internal(format!("Failed to register loader_cache_lookups_total: {}", e)))?,

            batch_chunks_total: register_counter_vec!(
                "medrota_batch_chunks_total",
                "Chunks handled by the bounded batch processor",
                &["status"]
            )
            .map_err(|e| DbError::internal(format!("Failed to register batch_chunks_total: {}", e)))?,

            job_cycles_total: register_counter_vec!(
                "medrota_job_cycles_total",
                "Background job cycles by outcome",
                &["job", "status"]
            )
            .map_err(|e| DbError::internal(format!("Failed to register job_cycles_total: {}", e)))?,
        })
    }

    /// Record how long an acquire waited.
    pub fn record_acquire(&self, acquired: bool, wait_secs: f64) {
        let outcome = if acquired { "acquired" } else { "timeout" };
        self.pool_acquire_wait_seconds
            .with_label_values(&[outcome])
            .observe(wait_secs);
    }

    /// Record a connection being opened or destroyed.
    pub fn record_connection_event(&self, event: &str) {
        self.pool_connection_events_total
            .with_label_values(&[event])
            .inc();
    }

    pub fn set_pool_max(&self, max: usize) {
        self.pool_max_connections.set(max as f64);
    }

    pub fn record_scaling_action(&self, direction: &str) {
        self.scaling_actions_total
            .with_label_values(&[direction])
            .inc();
    }

    /// Record a loader round trip.
    pub fn record_query(&self, operation: &str, relation: &str, success: bool, duration_secs: f64) {
        let status = if success { "success" } else { "error" };
        self.loader_queries_total
            .with_label_values(&[operation, relation, status])
            .inc();
        self.loader_query_duration_seconds
            .with_label_values(&[operation, relation])
            .observe(duration_secs);
    }

    pub fn record_cache_lookup(&self, operation: &str, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.loader_cache_lookups_total
            .with_label_values(&[operation, result])
            .inc();
    }

    pub fn record_batch_chunk(&self, success: bool) {
        let status = if success { "success" } else { "error" };
        self.batch_chunks_total.with_label_values(&[status]).inc();
    }

    pub fn record_job_cycle(&self, job: &str, success: bool) {
        let status = if success { "success" } else { "error" };
        self.job_cycles_total.with_label_values(&[job, status]).inc();
    }
}

/// Render every registered collector in the Prometheus text format.
pub fn encode_metrics() -> DbResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| DbError::internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| DbError::internal(format!("Metrics are not UTF-8: {}", e)))
}
