//! Medrota Telemetry - Observability Infrastructure
//!
//! Structured logging through `tracing` and Prometheus metrics for the pool,
//! scaling controller, loader and batch processor.

pub mod metrics;
pub mod tracer;

pub use metrics::{encode_metrics, DbMetrics, METRICS};
pub use tracer::{init_tracing, TelemetryConfig};
