//! Constants for the Medrota data access layer
//!
//! Every tunable has a named default here and an environment override in
//! [`crate::config`].

// ============================================================================
// CONNECTION POOL
// ============================================================================

/// Connections kept open even when idle
pub const DEFAULT_POOL_MIN: usize = 2;

/// Initial connection ceiling
pub const DEFAULT_POOL_MAX: usize = 10;

/// How long `acquire()` waits for a connection (5 seconds)
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 5_000;

/// Idle connections older than this are closed (30 seconds)
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;

/// Loans after which a connection is closed instead of reused
pub const DEFAULT_MAX_USES: u64 = 7_500;

/// Size of the acquire wait-time ring buffer
pub const WAIT_TIME_WINDOW: usize = 100;

// ============================================================================
// SESSION GUARDS
// ============================================================================

/// `statement_timeout` applied to every new connection (30 seconds)
pub const DEFAULT_STATEMENT_TIMEOUT_MS: u64 = 30_000;

/// `lock_timeout` applied to every new connection (10 seconds)
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;

/// `idle_in_transaction_session_timeout` applied to every new connection (60 seconds)
pub const DEFAULT_IDLE_IN_TRANSACTION_TIMEOUT_MS: u64 = 60_000;

// ============================================================================
// DYNAMIC SCALING
// ============================================================================

/// Hard ceiling the controller never scales past
pub const DEFAULT_SCALING_CEILING: usize = 50;

/// Scale up at or above this utilization
pub const DEFAULT_SCALE_UP_THRESHOLD: f64 = 0.8;

/// Scale down at or below this utilization
pub const DEFAULT_SCALE_DOWN_THRESHOLD: f64 = 0.3;

pub const DEFAULT_SCALE_UP_INCREMENT: usize = 5;

pub const DEFAULT_SCALE_DOWN_DECREMENT: usize = 2;

/// How often the controller samples the pool (30 seconds)
pub const DEFAULT_SCALING_EVALUATION_INTERVAL_MS: u64 = 30_000;

/// Minimum time between two ceiling changes (60 seconds)
pub const DEFAULT_MIN_SCALE_INTERVAL_MS: u64 = 60_000;

// ============================================================================
// CACHE
// ============================================================================

/// Batch-load result TTL (5 minutes)
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Expired-entry sweep cadence (1 minute)
pub const DEFAULT_CACHE_SWEEP_INTERVAL_SECS: u64 = 60;

pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 10_000;

// ============================================================================
// BATCH PROCESSING
// ============================================================================

pub const DEFAULT_BATCH_SIZE: usize = 100;

pub const DEFAULT_BATCH_CONCURRENCY: usize = 4;

// ============================================================================
// MAINTENANCE
// ============================================================================

/// Idle reaping and min-size top-up cadence (10 seconds)
pub const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 10;
