//! Row sources for the batch loader.

use async_trait::async_trait;
use medrota_core::{
    AnalyticsOptions, CompetencySummary, DateRange, EvaluationRecord, RotationId, RotationRecord,
    ScopeFilter, SubmissionRecord, TimeRecord, UserId, UserRecord,
};

use crate::error::DbResult;

/// One round trip per method, covering every id in the slice.
///
/// Implemented by pooled connection types. Ids arrive sorted and
/// deduplicated; implementations must not issue more than one query per
/// call.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Users joined with their program.
    async fn fetch_users(&self, ids: &[UserId], scope: &ScopeFilter)
        -> DbResult<Vec<UserRecord>>;

    async fn fetch_submissions(
        &self,
        user_ids: &[UserId],
        range: Option<DateRange>,
    ) -> DbResult<Vec<SubmissionRecord>>;

    async fn fetch_evaluations(
        &self,
        user_ids: &[UserId],
        range: Option<DateRange>,
    ) -> DbResult<Vec<EvaluationRecord>>;

    async fn fetch_time_records_for_users(
        &self,
        user_ids: &[UserId],
        range: Option<DateRange>,
    ) -> DbResult<Vec<TimeRecord>>;

    /// Rows of `mv_user_competency_progress`.
    async fn fetch_competency_progress(
        &self,
        user_ids: &[UserId],
        options: &AnalyticsOptions,
    ) -> DbResult<Vec<CompetencySummary>>;

    /// Rotations joined with their program and `mv_rotation_summary`.
    async fn fetch_rotations(
        &self,
        ids: &[RotationId],
        scope: &ScopeFilter,
    ) -> DbResult<Vec<RotationRecord>>;

    async fn fetch_time_records_for_rotations(
        &self,
        rotation_ids: &[RotationId],
        range: Option<DateRange>,
    ) -> DbResult<Vec<TimeRecord>>;
}
