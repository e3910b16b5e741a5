//! Tracing subscriber initialization.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{DbError, DbResult};

/// Logging configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Filter used when `RUST_LOG` is unset
    pub default_filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_filter: "medrota_db=info,info".to_string(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// - `RUST_LOG` overrides the filter
    /// - `MEDROTA_LOG_JSON` (default: false)
    pub fn from_env() -> Self {
        Self {
            json: std::env::var("MEDROTA_LOG_JSON")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(false),
            ..Self::default()
        }
    }
}

/// Install the global tracing subscriber.
///
/// Call once at startup. A second call returns an error instead of
/// replacing the installed subscriber.
pub fn init_tracing(config: &TelemetryConfig) -> DbResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| DbError::internal(format!("Failed to init subscriber: {}", e)))?;

    tracing::info!(json = config.json, "Tracing initialized");
    Ok(())
}
