//! Canonical cache keys.
//!
//! A key is the SHA-256 of the JSON serialization of
//! `{operation, ids, options}`, prefixed with the operation name so that all
//! entries of one operation can be dropped together. Ids must already be
//! sorted and deduplicated; options must serialize deterministically.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{DbError, DbResult};

/// Loader operations that own cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadOperation {
    UserProgress,
    CompetencyAnalytics,
    RotationOverview,
}

impl LoadOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadOperation::UserProgress => "user_progress",
            LoadOperation::CompetencyAnalytics => "competency_analytics",
            LoadOperation::RotationOverview => "rotation_overview",
        }
    }

    /// Prefix shared by every key of this operation.
    pub fn key_prefix(&self) -> String {
        format!("{}:", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

#[derive(Serialize)]
struct KeyMaterial<'a, I, O> {
    operation: LoadOperation,
    ids: &'a [I],
    options: &'a O,
}

impl CacheKey {
    pub fn derive<I: Serialize, O: Serialize>(
        operation: LoadOperation,
        ids: &[I],
        options: &O,
    ) -> DbResult<Self> {
        let material = serde_json::to_vec(&KeyMaterial {
            operation,
            ids,
            options,
        })
        .map_err(|e| DbError::internal(format!("Failed to serialize cache key: {}", e)))?;
        let digest = Sha256::digest(&material);
        Ok(Self(format!(
            "{}{}",
            operation.key_prefix(),
            hex::encode(digest)
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
