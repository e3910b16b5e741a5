//! Error Types for the Medrota data access layer
//!
//! Failures that affect data correctness (acquisition, transport, query)
//! surface to the caller as [`DbError`]. Failures that only affect
//! optimization (cache fills, scaling evaluation) are logged where they
//! happen and never reach this type.

use medrota_core::{ConfigError, ValidationError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Stable machine-readable category for each error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Database connection pool exhausted
    ConnectionPoolExhausted,

    /// Pool has been shut down
    ServiceUnavailable,

    /// Transport-level failure talking to the backend
    ConnectionFailed,

    /// Database operation failed
    DatabaseError,

    /// Configuration is invalid
    InvalidConfiguration,

    /// Input or decoded row failed validation
    ValidationFailed,

    /// Internal failure (telemetry registration, logging setup)
    InternalError,
}

// ============================================================================
// DB ERROR
// ============================================================================

/// Errors surfaced by the pool, loader and service.
#[derive(Debug, Clone, Error)]
pub enum DbError {
    #[error("Timed out after {waited:?} waiting for a connection (pool max {max_connections})")]
    AcquireTimeout {
        waited: Duration,
        max_connections: usize,
    },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Connection failed: {reason}")]
    Connection { reason: String },

    #[error("Query {operation} failed: {reason}")]
    Query { operation: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    pub fn connection(reason: impl Into<String>) -> Self {
        DbError::Connection {
            reason: reason.into(),
        }
    }

    pub fn query(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        DbError::Query {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        DbError::Internal {
            message: message.into(),
        }
    }

    /// Wrap a driver error raised by `operation`, classifying closed
    /// connections as transport failures.
    pub fn from_pg(operation: &str, err: tokio_postgres::Error) -> Self {
        tracing::error!(operation, error = ?err, "Database error");
        if err.is_closed() {
            DbError::connection(err.to_string())
        } else {
            DbError::query(operation, err.to_string())
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            DbError::AcquireTimeout { .. } => ErrorCode::ConnectionPoolExhausted,
            DbError::PoolClosed => ErrorCode::ServiceUnavailable,
            DbError::Connection { .. } => ErrorCode::ConnectionFailed,
            DbError::Query { .. } => ErrorCode::DatabaseError,
            DbError::Config(_) => ErrorCode::InvalidConfiguration,
            DbError::Validation(_) => ErrorCode::ValidationFailed,
            DbError::Internal { .. } => ErrorCode::InternalError,
        }
    }

    /// Whether a caller may reasonably retry with a fresh acquisition.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DbError::AcquireTimeout { .. } | DbError::Connection { .. }
        )
    }

    /// Whether the connection that produced this error should be evicted.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, DbError::Connection { .. })
    }
}

/// Build an error from the deadpool config layer.
impl From<deadpool_postgres::ConfigError> for DbError {
    fn from(err: deadpool_postgres::ConfigError) -> Self {
        DbError::Config(ConfigError::invalid("database", "<redacted>", err.to_string()))
    }
}

// ============================================================================
// RESULT TYPE ALIAS
// ============================================================================

/// Result type alias for data access operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let timeout = DbError::AcquireTimeout {
            waited: Duration::from_millis(500),
            max_connections: 5,
        };
        assert_eq!(timeout.code(), ErrorCode::ConnectionPoolExhausted);
        assert_eq!(DbError::PoolClosed.code(), ErrorCode::ServiceUnavailable);
        assert_eq!(DbError::query("fetch_users", "boom").code(), ErrorCode::DatabaseError);
        assert_eq!(
            DbError::from(ConfigError::invalid("pool.max", 0, "zero")).code(),
            ErrorCode::InvalidConfiguration
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(DbError::AcquireTimeout {
            waited: Duration::from_secs(1),
            max_connections: 1
        }
        .is_retryable());
        assert!(DbError::connection("reset by peer").is_retryable());
        assert!(!DbError::query("fetch_users", "syntax error").is_retryable());
        assert!(!DbError::PoolClosed.is_retryable());
    }

    #[test]
    fn test_display_includes_operation() {
        let msg = DbError::query("fetch_submissions", "canceling statement").to_string();
        assert!(msg.contains("fetch_submissions"));
        assert!(msg.contains("canceling statement"));
    }
}
