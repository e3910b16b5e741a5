//! Record structures returned by batch loads
//!
//! Each record mirrors the row shape of one joined query. Merged records
//! (`UserProgress`, `RotationOverview`) carry optional child collections that
//! are `None` when the caller did not opt into that relation.

use crate::{
    AssignmentId, CompetencyId, EvaluationId, ProgramId, RotationId, SubmissionId,
    SubmissionStatus, TenantId, TimeRecordId, Timestamp, UserId, UserRole,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A user joined with the program they belong to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub email: String,
    pub display_name: String,
    pub role: UserRole,
    pub program_id: Option<ProgramId>,
    pub program_name: Option<String>,
    pub created_at: Timestamp,
}

/// A competency submission joined with its assignment and competency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub submission_id: SubmissionId,
    pub user_id: UserId,
    pub assignment_id: AssignmentId,
    pub competency_id: CompetencyId,
    pub competency_name: String,
    pub status: SubmissionStatus,
    pub score: Option<f64>,
    pub submitted_at: Option<Timestamp>,
}

/// A faculty evaluation of a user, joined with the evaluator's name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub evaluation_id: EvaluationId,
    /// The user being evaluated.
    pub user_id: UserId,
    pub evaluator_id: UserId,
    pub evaluator_name: String,
    pub rotation_id: Option<RotationId>,
    pub rating: Option<f64>,
    pub comments: Option<String>,
    pub completed_at: Option<Timestamp>,
}

/// A clock-in / clock-out entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRecord {
    pub time_record_id: TimeRecordId,
    pub user_id: UserId,
    pub rotation_id: Option<RotationId>,
    pub clock_in: Timestamp,
    pub clock_out: Option<Timestamp>,
    pub hours: f64,
    pub approved: bool,
}

/// A user with the child collections requested by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProgress {
    pub user: UserRecord,
    pub submissions: Option<Vec<SubmissionRecord>>,
    pub evaluations: Option<Vec<EvaluationRecord>>,
    pub time_records: Option<Vec<TimeRecord>>,
}

impl UserProgress {
    /// A progress record with no child collections loaded.
    pub fn new(user: UserRecord) -> Self {
        Self {
            user,
            submissions: None,
            evaluations: None,
            time_records: None,
        }
    }

    /// Total approved hours across loaded time records.
    pub fn approved_hours(&self) -> f64 {
        self.time_records
            .iter()
            .flatten()
            .filter(|r| r.approved)
            .map(|r| r.hours)
            .sum()
    }
}

/// One row of the `mv_user_competency_progress` materialized view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetencySummary {
    pub user_id: UserId,
    pub competency_id: CompetencyId,
    pub competency_name: String,
    pub total_assignments: i64,
    pub completed_assignments: i64,
    pub average_score: Option<f64>,
    pub last_activity_at: Option<Timestamp>,
}

impl CompetencySummary {
    /// Completed / total, or 0 when nothing is assigned.
    pub fn completion_ratio(&self) -> f64 {
        if self.total_assignments <= 0 {
            0.0
        } else {
            self.completed_assignments as f64 / self.total_assignments as f64
        }
    }
}

/// Per-user roll-up of competency progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetencyAnalytics {
    pub user_id: UserId,
    pub competencies: Vec<CompetencySummary>,
    /// Completed over assigned across all competencies, 0.0 to 1.0.
    pub overall_completion: f64,
}

impl CompetencyAnalytics {
    pub fn from_summaries(user_id: UserId, competencies: Vec<CompetencySummary>) -> Self {
        let (done, total) = competencies.iter().fold((0i64, 0i64), |(d, t), c| {
            (d + c.completed_assignments, t + c.total_assignments)
        });
        let overall_completion = if total <= 0 {
            0.0
        } else {
            done as f64 / total as f64
        };
        Self {
            user_id,
            competencies,
            overall_completion,
        }
    }
}

/// A rotation joined with its program and the `mv_rotation_summary` view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationRecord {
    pub rotation_id: RotationId,
    pub tenant_id: TenantId,
    pub program_id: ProgramId,
    pub program_name: String,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Pre-aggregated; `0` when the view has no row yet.
    pub enrolled_count: i64,
    pub total_hours: f64,
    pub average_rating: Option<f64>,
}

/// A rotation with its optional time records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationOverview {
    pub rotation: RotationRecord,
    pub time_records: Option<Vec<TimeRecord>>,
}

impl RotationOverview {
    pub fn new(rotation: RotationRecord) -> Self {
        Self {
            rotation,
            time_records: None,
        }
    }
}
