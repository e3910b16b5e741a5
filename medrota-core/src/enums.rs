//! Enum types for Medrota records

use crate::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role of a user within a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Resident,
    Faculty,
    Coordinator,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Resident => "resident",
            UserRole::Faculty => "faculty",
            UserRole::Coordinator => "coordinator",
            UserRole::Admin => "admin",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "resident" => Ok(UserRole::Resident),
            "faculty" => Ok(UserRole::Faculty),
            "coordinator" => Ok(UserRole::Coordinator),
            "admin" => Ok(UserRole::Admin),
            other => Err(ValidationError::InvalidValue {
                field: "role".to_string(),
                reason: format!("unknown user role '{}'", other),
            }),
        }
    }
}

/// Review state of a competency submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Draft,
    Submitted,
    Approved,
    Rejected,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Draft => "draft",
            SubmissionStatus::Submitted => "submitted",
            SubmissionStatus::Approved => "approved",
            SubmissionStatus::Rejected => "rejected",
        }
    }

    /// Whether the submission counts toward competency completion.
    pub fn is_complete(&self) -> bool {
        matches!(self, SubmissionStatus::Approved)
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "draft" => Ok(SubmissionStatus::Draft),
            "submitted" => Ok(SubmissionStatus::Submitted),
            "approved" => Ok(SubmissionStatus::Approved),
            "rejected" => Ok(SubmissionStatus::Rejected),
            other => Err(ValidationError::InvalidValue {
                field: "status".to_string(),
                reason: format!("unknown submission status '{}'", other),
            }),
        }
    }
}

/// Child collections a batch load can opt into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Submissions,
    Evaluations,
    TimeRecords,
}

impl Relation {
    pub const ALL: [Relation; 3] = [
        Relation::Submissions,
        Relation::Evaluations,
        Relation::TimeRecords,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Submissions => "submissions",
            Relation::Evaluations => "evaluations",
            Relation::TimeRecords => "time_records",
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
