//! Health status reported by the connection pool.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Probe query succeeded and nobody is queued
    Healthy,
    /// Probe query succeeded while callers wait for a connection
    Degraded,
    /// No connection, or the probe query failed
    Unhealthy,
}

impl HealthStatus {
    /// Classify one probe: its outcome and the queue length right after it.
    pub fn from_probe(succeeded: bool, waiting: usize) -> Self {
        match (succeeded, waiting) {
            (false, _) => HealthStatus::Unhealthy,
            (true, 0) => HealthStatus::Healthy,
            (true, _) => HealthStatus::Degraded,
        }
    }

    pub fn is_operational(&self) -> bool {
        !matches!(self, HealthStatus::Unhealthy)
    }
}
