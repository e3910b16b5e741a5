//! Typed merge of child rows into their parent records
//!
//! Child relations are fetched as flat row sets covering every parent in the
//! batch. They are grouped by parent key and then applied to each parent with
//! replace semantics: a re-fetched collection always overwrites the previous
//! one, and a parent with no rows receives an empty collection rather than
//! `None` (the relation was requested, it just has no entries).

use crate::{
    EntityIdType, EvaluationRecord, Relation, RotationId, RotationOverview, SubmissionRecord,
    TimeRecord, UserId, UserProgress,
};
use std::collections::HashMap;

/// A row that belongs to exactly one parent record.
pub trait ChildRow {
    type ParentId: EntityIdType;

    fn parent_id(&self) -> Self::ParentId;
}

impl ChildRow for SubmissionRecord {
    type ParentId = UserId;

    fn parent_id(&self) -> UserId {
        self.user_id
    }
}

impl ChildRow for EvaluationRecord {
    type ParentId = UserId;

    fn parent_id(&self) -> UserId {
        self.user_id
    }
}

/// Time records keyed by user.
impl ChildRow for TimeRecord {
    type ParentId = UserId;

    fn parent_id(&self) -> UserId {
        self.user_id
    }
}

/// Group rows by their parent key, preserving row order within each group.
pub fn group_by_parent<C: ChildRow>(rows: Vec<C>) -> HashMap<C::ParentId, Vec<C>> {
    let mut grouped: HashMap<C::ParentId, Vec<C>> = HashMap::new();
    for row in rows {
        grouped.entry(row.parent_id()).or_default().push(row);
    }
    grouped
}

/// Group time records by rotation. Rows without a rotation are dropped.
pub fn group_by_rotation(rows: Vec<TimeRecord>) -> HashMap<RotationId, Vec<TimeRecord>> {
    let mut grouped: HashMap<RotationId, Vec<TimeRecord>> = HashMap::new();
    for row in rows {
        if let Some(rotation_id) = row.rotation_id {
            grouped.entry(rotation_id).or_default().push(row);
        }
    }
    grouped
}

/// Rows of one child relation, for a single parent or a whole batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildRows {
    Submissions(Vec<SubmissionRecord>),
    Evaluations(Vec<EvaluationRecord>),
    TimeRecords(Vec<TimeRecord>),
}

impl ChildRows {
    pub fn relation(&self) -> Relation {
        match self {
            ChildRows::Submissions(_) => Relation::Submissions,
            ChildRows::Evaluations(_) => Relation::Evaluations,
            ChildRows::TimeRecords(_) => Relation::TimeRecords,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ChildRows::Submissions(rows) => rows.len(),
            ChildRows::Evaluations(rows) => rows.len(),
            ChildRows::TimeRecords(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl UserProgress {
    /// Install a child collection, replacing whatever was there.
    pub fn apply(&mut self, rows: ChildRows) {
        match rows {
            ChildRows::Submissions(rows) => self.submissions = Some(rows),
            ChildRows::Evaluations(rows) => self.evaluations = Some(rows),
            ChildRows::TimeRecords(rows) => self.time_records = Some(rows),
        }
    }
}

impl RotationOverview {
    /// Install the rotation's time records, replacing any previous set.
    pub fn apply_time_records(&mut self, rows: Vec<TimeRecord>) {
        self.time_records = Some(rows);
    }
}

/// Merge one relation's grouped rows into every parent of the batch.
///
/// Parents absent from `grouped` get an empty collection.
pub fn merge_relation<C>(
    parents: &mut [UserProgress],
    mut grouped: HashMap<UserId, Vec<C>>,
    wrap: fn(Vec<C>) -> ChildRows,
) {
    for parent in parents.iter_mut() {
        let rows = grouped.remove(&parent.user.user_id).unwrap_or_default();
        parent.apply(wrap(rows));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AssignmentId, CompetencyId, SubmissionId, SubmissionStatus, TenantId, UserRecord, UserRole,
    };
    use chrono::Utc;

    fn user(id: UserId) -> UserProgress {
        UserProgress::new(UserRecord {
            user_id: id,
            tenant_id: TenantId::nil(),
            email: format!("{}@example.org", id),
            display_name: "Test".to_string(),
            role: UserRole::Resident,
            program_id: None,
            program_name: None,
            created_at: Utc::now(),
        })
    }

    fn submission(user_id: UserId) -> SubmissionRecord {
        SubmissionRecord {
            submission_id: SubmissionId::now_v7(),
            user_id,
            assignment_id: AssignmentId::now_v7(),
            competency_id: CompetencyId::now_v7(),
            competency_name: "Professionalism".to_string(),
            status: SubmissionStatus::Submitted,
            score: Some(3.5),
            submitted_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_group_by_parent_keeps_row_order() {
        let a = UserId::now_v7();
        let b = UserId::now_v7();
        let rows = vec![submission(a), submission(b), submission(a)];
        let first = rows[0].submission_id;
        let third = rows[2].submission_id;
        let grouped = group_by_parent(rows);
        let for_a: Vec<_> = grouped[&a].iter().map(|s| s.submission_id).collect();
        assert_eq!(for_a, vec![first, third]);
        assert_eq!(grouped[&b].len(), 1);
    }

    #[test]
    fn test_merge_gives_empty_collection_to_parents_without_rows() {
        let a = UserId::now_v7();
        let b = UserId::now_v7();
        let mut parents = vec![user(a), user(b)];
        merge_relation(
            &mut parents,
            group_by_parent(vec![submission(a)]),
            ChildRows::Submissions,
        );
        assert_eq!(parents[0].submissions.as_ref().map(Vec::len), Some(1));
        assert_eq!(parents[1].submissions, Some(vec![]));
        assert!(parents[0].evaluations.is_none());
    }

    #[test]
    fn test_apply_replaces_rather_than_appends() {
        let a = UserId::now_v7();
        let mut progress = user(a);
        progress.apply(ChildRows::Submissions(vec![submission(a), submission(a)]));
        let fresh = submission(a);
        progress.apply(ChildRows::Submissions(vec![fresh.clone()]));
        assert_eq!(progress.submissions, Some(vec![fresh]));
    }

    #[test]
    fn test_group_by_rotation_drops_unassigned_rows() {
        let rotation = RotationId::now_v7();
        let record = |rotation_id| TimeRecord {
            time_record_id: crate::TimeRecordId::now_v7(),
            user_id: UserId::now_v7(),
            rotation_id,
            clock_in: Utc::now(),
            clock_out: None,
            hours: 1.0,
            approved: true,
        };
        let grouped = group_by_rotation(vec![record(Some(rotation)), record(None)]);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[&rotation].len(), 1);
    }
}
