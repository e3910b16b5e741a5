//! Configuration Module
//!
//! Every tunable of the data access layer is a named option loaded from
//! environment variables with a documented default (see [`crate::constants`]).
//! Each struct validates itself before the service is built.

use std::str::FromStr;
use std::time::Duration;

use medrota_core::ConfigError;
use medrota_storage::CacheStoreConfig;

use crate::constants::*;
use crate::error::DbResult;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_or(key, default_ms))
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_or(key, default_secs))
}

// ============================================================================
// ENVIRONMENT
// ============================================================================

/// Deployment environment. Only production enables pool scaling by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    /// Read `MEDROTA_ENVIRONMENT` (default: development).
    pub fn from_env() -> Self {
        std::env::var("MEDROTA_ENVIRONMENT")
            .map(|s| Self::parse(&s))
            .unwrap_or_default()
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "staging" => Environment::Staging,
            _ => Environment::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

// ============================================================================
// DATABASE CONNECTION
// ============================================================================

/// Backend address and credentials.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Reported as `application_name` in pg_stat_activity
    pub application_name: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "medrota".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            application_name: "medrota-db".to_string(),
        }
    }
}

impl DbConfig {
    /// Create a new database configuration from environment variables.
    ///
    /// - `MEDROTA_DB_HOST` (default: localhost)
    /// - `MEDROTA_DB_PORT` (default: 5432)
    /// - `MEDROTA_DB_NAME` (default: medrota)
    /// - `MEDROTA_DB_USER` (default: postgres)
    /// - `MEDROTA_DB_PASSWORD` (default: empty)
    /// - `MEDROTA_DB_APPLICATION_NAME` (default: medrota-db)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("MEDROTA_DB_HOST").unwrap_or(defaults.host),
            port: env_or("MEDROTA_DB_PORT", defaults.port),
            dbname: std::env::var("MEDROTA_DB_NAME").unwrap_or(defaults.dbname),
            user: std::env::var("MEDROTA_DB_USER").unwrap_or(defaults.user),
            password: std::env::var("MEDROTA_DB_PASSWORD").unwrap_or_default(),
            application_name: std::env::var("MEDROTA_DB_APPLICATION_NAME")
                .unwrap_or(defaults.application_name),
        }
    }

    /// Build the driver configuration through deadpool's config layer.
    pub fn pg_config(&self, connect_timeout: Duration) -> DbResult<tokio_postgres::Config> {
        let mut cfg = deadpool_postgres::Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg.application_name = Some(self.application_name.clone());
        cfg.connect_timeout = Some(connect_timeout);
        Ok(cfg.get_pg_config()?)
    }
}

// ============================================================================
// SESSION GUARDS
// ============================================================================

/// Server-side timeouts applied to every newly opened connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionGuards {
    pub statement_timeout: Duration,
    pub lock_timeout: Duration,
    pub idle_in_transaction_timeout: Duration,
}

impl Default for SessionGuards {
    fn default() -> Self {
        Self {
            statement_timeout: Duration::from_millis(DEFAULT_STATEMENT_TIMEOUT_MS),
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            idle_in_transaction_timeout: Duration::from_millis(
                DEFAULT_IDLE_IN_TRANSACTION_TIMEOUT_MS,
            ),
        }
    }
}

impl SessionGuards {
    /// - `MEDROTA_STATEMENT_TIMEOUT_MS` (default: 30000)
    /// - `MEDROTA_LOCK_TIMEOUT_MS` (default: 10000)
    /// - `MEDROTA_IDLE_IN_TX_TIMEOUT_MS` (default: 60000)
    pub fn from_env() -> Self {
        Self {
            statement_timeout: env_millis(
                "MEDROTA_STATEMENT_TIMEOUT_MS",
                DEFAULT_STATEMENT_TIMEOUT_MS,
            ),
            lock_timeout: env_millis("MEDROTA_LOCK_TIMEOUT_MS", DEFAULT_LOCK_TIMEOUT_MS),
            idle_in_transaction_timeout: env_millis(
                "MEDROTA_IDLE_IN_TX_TIMEOUT_MS",
                DEFAULT_IDLE_IN_TRANSACTION_TIMEOUT_MS,
            ),
        }
    }

    /// `SET` statements applying the guards, as one batch.
    pub fn to_sql(&self) -> String {
        format!(
            "SET statement_timeout = {}; SET lock_timeout = {}; SET idle_in_transaction_session_timeout = {};",
            self.statement_timeout.as_millis(),
            self.lock_timeout.as_millis(),
            self.idle_in_transaction_timeout.as_millis()
        )
    }
}

// ============================================================================
// CONNECTION POOL
// ============================================================================

/// Pool bounds and connection lifecycle limits.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Connections kept open even when idle
    pub min_connections: usize,
    /// Initial ceiling; the scaling controller moves it at runtime
    pub max_connections: usize,
    /// Maximum time `acquire()` waits
    pub connection_timeout: Duration,
    /// Idle connections older than this are closed
    pub idle_timeout: Duration,
    /// Loans after which a connection is destroyed on release
    pub max_uses: u64,
    /// Applied to each new connection
    pub session_guards: SessionGuards,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: DEFAULT_POOL_MIN,
            max_connections: DEFAULT_POOL_MAX,
            connection_timeout: Duration::from_millis(DEFAULT_CONNECTION_TIMEOUT_MS),
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            max_uses: DEFAULT_MAX_USES,
            session_guards: SessionGuards::default(),
        }
    }
}

impl PoolConfig {
    /// - `MEDROTA_POOL_MIN` (default: 2)
    /// - `MEDROTA_POOL_MAX` (default: 10)
    /// - `MEDROTA_POOL_CONNECTION_TIMEOUT_MS` (default: 5000)
    /// - `MEDROTA_POOL_IDLE_TIMEOUT_MS` (default: 30000)
    /// - `MEDROTA_POOL_MAX_USES` (default: 7500)
    pub fn from_env() -> Self {
        Self {
            min_connections: env_or("MEDROTA_POOL_MIN", DEFAULT_POOL_MIN),
            max_connections: env_or("MEDROTA_POOL_MAX", DEFAULT_POOL_MAX),
            connection_timeout: env_millis(
                "MEDROTA_POOL_CONNECTION_TIMEOUT_MS",
                DEFAULT_CONNECTION_TIMEOUT_MS,
            ),
            idle_timeout: env_millis("MEDROTA_POOL_IDLE_TIMEOUT_MS", DEFAULT_IDLE_TIMEOUT_MS),
            max_uses: env_or("MEDROTA_POOL_MAX_USES", DEFAULT_MAX_USES),
            session_guards: SessionGuards::from_env(),
        }
    }

    pub fn with_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_connections = min;
        self.max_connections = max;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_uses(mut self, max_uses: u64) -> Self {
        self.max_uses = max_uses;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::invalid(
                "pool.max_connections",
                self.max_connections,
                "must be greater than zero",
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError::invalid(
                "pool.min_connections",
                self.min_connections,
                format!("must not exceed max_connections ({})", self.max_connections),
            ));
        }
        if self.connection_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "pool.connection_timeout",
                "0ms",
                "must be greater than zero",
            ));
        }
        if self.max_uses == 0 {
            return Err(ConfigError::invalid(
                "pool.max_uses",
                self.max_uses,
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// DYNAMIC SCALING
// ============================================================================

/// Controller thresholds, steps and timing.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingConfig {
    pub enabled: bool,
    /// Floor for the pool ceiling
    pub min_connections: usize,
    /// Hard ceiling
    pub max_connections: usize,
    /// Utilization (0.0 to 1.0) at or above which the ceiling grows
    pub scale_up_threshold: f64,
    /// Utilization at or below which the ceiling shrinks
    pub scale_down_threshold: f64,
    pub scale_up_increment: usize,
    pub scale_down_decrement: usize,
    pub evaluation_interval: Duration,
    /// Minimum time between two applied changes
    pub min_scale_interval: Duration,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_connections: DEFAULT_POOL_MIN,
            max_connections: DEFAULT_SCALING_CEILING,
            scale_up_threshold: DEFAULT_SCALE_UP_THRESHOLD,
            scale_down_threshold: DEFAULT_SCALE_DOWN_THRESHOLD,
            scale_up_increment: DEFAULT_SCALE_UP_INCREMENT,
            scale_down_decrement: DEFAULT_SCALE_DOWN_DECREMENT,
            evaluation_interval: Duration::from_millis(DEFAULT_SCALING_EVALUATION_INTERVAL_MS),
            min_scale_interval: Duration::from_millis(DEFAULT_MIN_SCALE_INTERVAL_MS),
        }
    }
}

impl ScalingConfig {
    /// - `MEDROTA_SCALING_ENABLED` (default: true only in production)
    /// - `MEDROTA_SCALING_MIN` (default: pool min)
    /// - `MEDROTA_SCALING_MAX` (default: 50)
    /// - `MEDROTA_SCALING_UP_THRESHOLD` / `MEDROTA_SCALING_DOWN_THRESHOLD` (default: 0.8 / 0.3)
    /// - `MEDROTA_SCALING_UP_INCREMENT` / `MEDROTA_SCALING_DOWN_DECREMENT` (default: 5 / 2)
    /// - `MEDROTA_SCALING_EVALUATION_INTERVAL_MS` (default: 30000)
    /// - `MEDROTA_SCALING_MIN_INTERVAL_MS` (default: 60000)
    pub fn from_env(environment: Environment, pool: &PoolConfig) -> Self {
        let enabled = std::env::var("MEDROTA_SCALING_ENABLED")
            .ok()
            .map(|s| s == "true" || s == "1")
            .unwrap_or_else(|| environment.is_production());

        Self {
            enabled,
            min_connections: env_or("MEDROTA_SCALING_MIN", pool.min_connections),
            max_connections: env_or("MEDROTA_SCALING_MAX", DEFAULT_SCALING_CEILING),
            scale_up_threshold: env_or("MEDROTA_SCALING_UP_THRESHOLD", DEFAULT_SCALE_UP_THRESHOLD),
            scale_down_threshold: env_or(
                "MEDROTA_SCALING_DOWN_THRESHOLD",
                DEFAULT_SCALE_DOWN_THRESHOLD,
            ),
            scale_up_increment: env_or("MEDROTA_SCALING_UP_INCREMENT", DEFAULT_SCALE_UP_INCREMENT),
            scale_down_decrement: env_or(
                "MEDROTA_SCALING_DOWN_DECREMENT",
                DEFAULT_SCALE_DOWN_DECREMENT,
            ),
            evaluation_interval: env_millis(
                "MEDROTA_SCALING_EVALUATION_INTERVAL_MS",
                DEFAULT_SCALING_EVALUATION_INTERVAL_MS,
            ),
            min_scale_interval: env_millis(
                "MEDROTA_SCALING_MIN_INTERVAL_MS",
                DEFAULT_MIN_SCALE_INTERVAL_MS,
            ),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_connections == 0 || self.min_connections > self.max_connections {
            return Err(ConfigError::invalid(
                "scaling.min_connections",
                self.min_connections,
                format!("must be in 1..={}", self.max_connections),
            ));
        }
        for (field, value) in [
            ("scaling.scale_up_threshold", self.scale_up_threshold),
            ("scaling.scale_down_threshold", self.scale_down_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::invalid(field, value, "must be within 0.0..=1.0"));
            }
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "scaling.scale_down_threshold".to_string(),
                option_b: "scaling.scale_up_threshold".to_string(),
            });
        }
        if self.scale_up_increment == 0 || self.scale_down_decrement == 0 {
            return Err(ConfigError::invalid(
                "scaling.increment",
                0,
                "scale steps must be greater than zero",
            ));
        }
        if self.evaluation_interval.is_zero() {
            return Err(ConfigError::invalid(
                "scaling.evaluation_interval",
                "0ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// CACHE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub sweep_interval: Duration,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_CACHE_SWEEP_INTERVAL_SECS),
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
        }
    }
}

impl CacheConfig {
    /// - `MEDROTA_CACHE_TTL_SECS` (default: 300)
    /// - `MEDROTA_CACHE_SWEEP_INTERVAL_SECS` (default: 60)
    /// - `MEDROTA_CACHE_MAX_ENTRIES` (default: 10000)
    pub fn from_env() -> Self {
        Self {
            ttl: env_secs("MEDROTA_CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS),
            sweep_interval: env_secs(
                "MEDROTA_CACHE_SWEEP_INTERVAL_SECS",
                DEFAULT_CACHE_SWEEP_INTERVAL_SECS,
            ),
            max_entries: env_or("MEDROTA_CACHE_MAX_ENTRIES", DEFAULT_CACHE_MAX_ENTRIES),
        }
    }

    pub fn store_config(&self) -> CacheStoreConfig {
        CacheStoreConfig::new()
            .with_ttl(self.ttl)
            .with_max_entries(self.max_entries)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::invalid(
                "cache.max_entries",
                0,
                "must be greater than zero",
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::invalid(
                "cache.sweep_interval",
                "0s",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// BATCH PROCESSING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Items per chunk
    pub batch_size: usize,
    /// Chunks in flight per wave
    pub max_concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrency: DEFAULT_BATCH_CONCURRENCY,
        }
    }
}

impl BatchConfig {
    pub fn new(batch_size: usize, max_concurrency: usize) -> Self {
        Self {
            batch_size,
            max_concurrency,
        }
    }

    /// - `MEDROTA_BATCH_SIZE` (default: 100)
    /// - `MEDROTA_BATCH_CONCURRENCY` (default: 4)
    pub fn from_env() -> Self {
        Self {
            batch_size: env_or("MEDROTA_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            max_concurrency: env_or("MEDROTA_BATCH_CONCURRENCY", DEFAULT_BATCH_CONCURRENCY),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid(
                "batch.batch_size",
                0,
                "must be greater than zero",
            ));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::invalid(
                "batch.max_concurrency",
                0,
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// SERVICE
// ============================================================================

/// Everything needed to build a [`crate::DbService`].
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub environment: Environment,
    pub database: DbConfig,
    pub pool: PoolConfig,
    pub scaling: ScalingConfig,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    /// Idle reaping and min-size top-up cadence
    pub maintenance_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            database: DbConfig::default(),
            pool: PoolConfig::default(),
            scaling: ScalingConfig::default(),
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
            maintenance_interval: Duration::from_secs(DEFAULT_MAINTENANCE_INTERVAL_SECS),
        }
    }
}

impl ServiceConfig {
    /// Load the full configuration from the environment.
    ///
    /// `MEDROTA_MAINTENANCE_INTERVAL_SECS` (default: 10) controls pool
    /// maintenance; see the other `from_env` constructors for the rest.
    pub fn from_env() -> Self {
        let environment = Environment::from_env();
        let pool = PoolConfig::from_env();
        let scaling = ScalingConfig::from_env(environment, &pool);
        Self {
            environment,
            database: DbConfig::from_env(),
            pool,
            scaling,
            cache: CacheConfig::from_env(),
            batch: BatchConfig::from_env(),
            maintenance_interval: env_secs(
                "MEDROTA_MAINTENANCE_INTERVAL_SECS",
                DEFAULT_MAINTENANCE_INTERVAL_SECS,
            ),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        self.cache.validate()?;
        self.batch.validate()?;
        if self.scaling.enabled {
            self.scaling.validate()?;
            if self.scaling.min_connections < self.pool.min_connections {
                return Err(ConfigError::IncompatibleOptions {
                    option_a: "scaling.min_connections".to_string(),
                    option_b: "pool.min_connections".to_string(),
                });
            }
            if !(self.scaling.min_connections..=self.scaling.max_connections)
                .contains(&self.pool.max_connections)
            {
                return Err(ConfigError::invalid(
                    "pool.max_connections",
                    self.pool.max_connections,
                    format!(
                        "must be within scaling bounds {}..={}",
                        self.scaling.min_connections, self.scaling.max_connections
                    ),
                ));
            }
        }
        if self.maintenance_interval.is_zero() {
            return Err(ConfigError::invalid(
                "maintenance_interval",
                "0s",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parse() {
        assert_eq!(Environment::parse("Production"), Environment::Production);
        assert_eq!(Environment::parse("staging"), Environment::Staging);
        assert_eq!(Environment::parse("anything"), Environment::Development);
    }

    #[test]
    fn test_defaults_validate() {
        ServiceConfig::default().validate().unwrap();
        let mut config = ServiceConfig::default();
        config.scaling.enabled = true;
        config.validate().unwrap();
    }

    #[test]
    fn test_pool_rejects_min_above_max() {
        let config = PoolConfig::default().with_bounds(6, 5);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pool.min_connections"));
    }

    #[test]
    fn test_scaling_rejects_inverted_thresholds() {
        let config = ScalingConfig {
            scale_up_threshold: 0.2,
            scale_down_threshold: 0.5,
            ..ScalingConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IncompatibleOptions { .. })
        ));
    }

    #[test]
    fn test_scaling_rejects_threshold_out_of_range() {
        let config = ScalingConfig {
            scale_up_threshold: 80.0,
            ..ScalingConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_service_rejects_pool_max_outside_scaling_bounds() {
        let mut config = ServiceConfig::default();
        config.scaling.enabled = true;
        config.scaling.max_connections = 8;
        config.pool.max_connections = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_batch_rejects_zero_size() {
        assert!(BatchConfig::new(0, 4).validate().is_err());
        assert!(BatchConfig::new(10, 0).validate().is_err());
        BatchConfig::new(10, 4).validate().unwrap();
    }

    #[test]
    fn test_session_guards_sql() {
        let sql = SessionGuards::default().to_sql();
        assert!(sql.contains("statement_timeout = 30000"));
        assert!(sql.contains("lock_timeout = 10000"));
        assert!(sql.contains("idle_in_transaction_session_timeout = 60000"));
    }

    #[test]
    fn test_pg_config_builds_from_defaults() {
        let cfg = DbConfig::default()
            .pg_config(Duration::from_secs(5))
            .unwrap();
        assert_eq!(cfg.get_dbname(), Some("medrota"));
        assert_eq!(cfg.get_ports(), &[5432]);
    }
}
