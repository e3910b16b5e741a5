//! PostgreSQL row source.
//!
//! Every query binds the whole id set as one array parameter (`= ANY($1)`).
//! Scope and date-range filters are optional parameters that collapse to
//! `TRUE` when NULL, so each method has exactly one statement shape.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::NaiveDate;
use medrota_core::{
    raw_ids, AnalyticsOptions, AssignmentId, CompetencyId, CompetencySummary, DateRange,
    EntityIdType, EvaluationId, EvaluationRecord, ProgramId, RotationId, RotationRecord,
    ScopeFilter, SubmissionId, SubmissionRecord, SubmissionStatus, TenantId, TimeRecord,
    TimeRecordId, Timestamp, UserId, UserRecord, UserRole,
};
use tokio_postgres::types::{FromSql, ToSql};
use tokio_postgres::Row;
use uuid::Uuid;

use super::source::RecordSource;
use crate::error::{DbError, DbResult};
use crate::pool::PgConnection;

const USERS_SQL: &str = "
    SELECT u.id, u.tenant_id, u.email, u.display_name, u.role,
           u.program_id, p.name AS program_name, u.created_at
    FROM users u
    LEFT JOIN programs p ON p.id = u.program_id
    WHERE u.id = ANY($1)
      AND ($2::uuid IS NULL OR u.tenant_id = $2)
      AND ($3::uuid IS NULL OR u.program_id = $3)
    ORDER BY u.id";

const SUBMISSIONS_SQL: &str = "
    SELECT s.id, s.user_id, s.assignment_id, ca.competency_id,
           c.name AS competency_name, s.status, s.score::float8 AS score, s.submitted_at
    FROM submissions s
    JOIN competency_assignments ca ON ca.id = s.assignment_id
    JOIN competencies c ON c.id = ca.competency_id
    WHERE s.user_id = ANY($1)
      AND ($2::timestamptz IS NULL OR s.submitted_at >= $2)
      AND ($3::timestamptz IS NULL OR s.submitted_at <= $3)
    ORDER BY s.user_id, s.submitted_at DESC NULLS LAST, s.id";

const EVALUATIONS_SQL: &str = "
    SELECT e.id, e.user_id, e.evaluator_id, ev.display_name AS evaluator_name,
           e.rotation_id, e.rating::float8 AS rating, e.comments, e.completed_at
    FROM evaluations e
    JOIN users ev ON ev.id = e.evaluator_id
    WHERE e.user_id = ANY($1)
      AND ($2::timestamptz IS NULL OR e.completed_at >= $2)
      AND ($3::timestamptz IS NULL OR e.completed_at <= $3)
    ORDER BY e.user_id, e.completed_at DESC NULLS LAST, e.id";

const USER_TIME_RECORDS_SQL: &str = "
    SELECT t.id, t.user_id, t.rotation_id, t.clock_in, t.clock_out,
           t.hours::float8 AS hours, t.approved
    FROM time_records t
    WHERE t.user_id = ANY($1)
      AND ($2::timestamptz IS NULL OR t.clock_in >= $2)
      AND ($3::timestamptz IS NULL OR t.clock_in <= $3)
    ORDER BY t.user_id, t.clock_in, t.id";

const ROTATION_TIME_RECORDS_SQL: &str = "
    SELECT t.id, t.user_id, t.rotation_id, t.clock_in, t.clock_out,
           t.hours::float8 AS hours, t.approved
    FROM time_records t
    WHERE t.rotation_id = ANY($1)
      AND ($2::timestamptz IS NULL OR t.clock_in >= $2)
      AND ($3::timestamptz IS NULL OR t.clock_in <= $3)
    ORDER BY t.rotation_id, t.clock_in, t.id";

const COMPETENCY_PROGRESS_SQL: &str = "
    SELECT v.user_id, v.competency_id, v.competency_name,
           v.total_assignments::int8 AS total_assignments,
           v.completed_assignments::int8 AS completed_assignments,
           v.average_score::float8 AS average_score, v.last_activity_at
    FROM mv_user_competency_progress v
    WHERE v.user_id = ANY($1)
      AND ($2::uuid IS NULL OR v.tenant_id = $2)
      AND ($3::uuid IS NULL OR v.program_id = $3)
      AND ($4::uuid[] IS NULL OR v.competency_id = ANY($4))
    ORDER BY v.user_id, v.competency_name, v.competency_id";

const ROTATIONS_SQL: &str = "
    SELECT r.id, r.tenant_id, r.program_id, p.name AS program_name, r.name,
           r.start_date, r.end_date,
           COALESCE(s.enrolled_count, 0)::int8 AS enrolled_count,
           COALESCE(s.total_hours, 0)::float8 AS total_hours,
           s.average_rating::float8 AS average_rating
    FROM rotations r
    JOIN programs p ON p.id = r.program_id
    LEFT JOIN mv_rotation_summary s ON s.rotation_id = r.id
    WHERE r.id = ANY($1)
      AND ($2::uuid IS NULL OR r.tenant_id = $2)
      AND ($3::uuid IS NULL OR r.program_id = $3)
    ORDER BY r.id";

fn col<'a, T: FromSql<'a>>(row: &'a Row, operation: &str, name: &str) -> DbResult<T> {
    row.try_get(name)
        .map_err(|e| DbError::query(operation, format!("column {}: {}", name, e)))
}

fn id<I: EntityIdType>(row: &Row, operation: &str, name: &str) -> DbResult<I> {
    Ok(I::new(col::<Uuid>(row, operation, name)?))
}

fn opt_id<I: EntityIdType>(row: &Row, operation: &str, name: &str) -> DbResult<Option<I>> {
    Ok(col::<Option<Uuid>>(row, operation, name)?.map(I::new))
}

fn range_bounds(range: Option<DateRange>) -> (Option<Timestamp>, Option<Timestamp>) {
    match range {
        Some(r) => (Some(r.start()), Some(r.end())),
        None => (None, None),
    }
}

fn scope_params(scope: &ScopeFilter) -> (Option<Uuid>, Option<Uuid>) {
    (
        scope.tenant_id.map(|t| t.as_uuid()),
        scope.program_id.map(|p| p.as_uuid()),
    )
}

impl PgConnection {
    async fn fetch(
        &self,
        operation: &str,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> DbResult<Vec<Row>> {
        self.client()
            .query(sql, params)
            .await
            .map_err(|e| DbError::from_pg(operation, e))
    }
}

fn user_row(row: &Row) -> DbResult<UserRecord> {
    const OP: &str = "fetch_users";
    Ok(UserRecord {
        user_id: id(row, OP, "id")?,
        tenant_id: id::<TenantId>(row, OP, "tenant_id")?,
        email: col(row, OP, "email")?,
        display_name: col(row, OP, "display_name")?,
        role: UserRole::from_str(col::<&str>(row, OP, "role")?)?,
        program_id: opt_id::<ProgramId>(row, OP, "program_id")?,
        program_name: col(row, OP, "program_name")?,
        created_at: col(row, OP, "created_at")?,
    })
}

fn submission_row(row: &Row) -> DbResult<SubmissionRecord> {
    const OP: &str = "fetch_submissions";
    Ok(SubmissionRecord {
        submission_id: id::<SubmissionId>(row, OP, "id")?,
        user_id: id(row, OP, "user_id")?,
        assignment_id: id::<AssignmentId>(row, OP, "assignment_id")?,
        competency_id: id::<CompetencyId>(row, OP, "competency_id")?,
        competency_name: col(row, OP, "competency_name")?,
        status: SubmissionStatus::from_str(col::<&str>(row, OP, "status")?)?,
        score: col(row, OP, "score")?,
        submitted_at: col(row, OP, "submitted_at")?,
    })
}

fn evaluation_row(row: &Row) -> DbResult<EvaluationRecord> {
    const OP: &str = "fetch_evaluations";
    Ok(EvaluationRecord {
        evaluation_id: id::<EvaluationId>(row, OP, "id")?,
        user_id: id(row, OP, "user_id")?,
        evaluator_id: id(row, OP, "evaluator_id")?,
        evaluator_name: col(row, OP, "evaluator_name")?,
        rotation_id: opt_id::<RotationId>(row, OP, "rotation_id")?,
        rating: col(row, OP, "rating")?,
        comments: col(row, OP, "comments")?,
        completed_at: col(row, OP, "completed_at")?,
    })
}

fn time_record_row(row: &Row) -> DbResult<TimeRecord> {
    const OP: &str = "fetch_time_records";
    Ok(TimeRecord {
        time_record_id: id::<TimeRecordId>(row, OP, "id")?,
        user_id: id(row, OP, "user_id")?,
        rotation_id: opt_id::<RotationId>(row, OP, "rotation_id")?,
        clock_in: col(row, OP, "clock_in")?,
        clock_out: col(row, OP, "clock_out")?,
        hours: col(row, OP, "hours")?,
        approved: col(row, OP, "approved")?,
    })
}

fn competency_row(row: &Row) -> DbResult<CompetencySummary> {
    const OP: &str = "fetch_competency_progress";
    Ok(CompetencySummary {
        user_id: id(row, OP, "user_id")?,
        competency_id: id::<CompetencyId>(row, OP, "competency_id")?,
        competency_name: col(row, OP, "competency_name")?,
        total_assignments: col(row, OP, "total_assignments")?,
        completed_assignments: col(row, OP, "completed_assignments")?,
        average_score: col(row, OP, "average_score")?,
        last_activity_at: col(row, OP, "last_activity_at")?,
    })
}

fn rotation_row(row: &Row) -> DbResult<RotationRecord> {
    const OP: &str = "fetch_rotations";
    Ok(RotationRecord {
        rotation_id: id::<RotationId>(row, OP, "id")?,
        tenant_id: id::<TenantId>(row, OP, "tenant_id")?,
        program_id: id::<ProgramId>(row, OP, "program_id")?,
        program_name: col(row, OP, "program_name")?,
        name: col(row, OP, "name")?,
        start_date: col::<NaiveDate>(row, OP, "start_date")?,
        end_date: col::<NaiveDate>(row, OP, "end_date")?,
        enrolled_count: col(row, OP, "enrolled_count")?,
        total_hours: col(row, OP, "total_hours")?,
        average_rating: col(row, OP, "average_rating")?,
    })
}

#[async_trait]
impl RecordSource for PgConnection {
    async fn fetch_users(&self, ids: &[UserId], scope: &ScopeFilter) -> DbResult<Vec<UserRecord>> {
        let ids = raw_ids(ids);
        let (tenant, program) = scope_params(scope);
        self.fetch("fetch_users", USERS_SQL, &[&ids, &tenant, &program])
            .await?
            .iter()
            .map(user_row)
            .collect()
    }

    async fn fetch_submissions(
        &self,
        user_ids: &[UserId],
        range: Option<DateRange>,
    ) -> DbResult<Vec<SubmissionRecord>> {
        let ids = raw_ids(user_ids);
        let (from, to) = range_bounds(range);
        self.fetch("fetch_submissions", SUBMISSIONS_SQL, &[&ids, &from, &to])
            .await?
            .iter()
            .map(submission_row)
            .collect()
    }

    async fn fetch_evaluations(
        &self,
        user_ids: &[UserId],
        range: Option<DateRange>,
    ) -> DbResult<Vec<EvaluationRecord>> {
        let ids = raw_ids(user_ids);
        let (from, to) = range_bounds(range);
        self.fetch("fetch_evaluations", EVALUATIONS_SQL, &[&ids, &from, &to])
            .await?
            .iter()
            .map(evaluation_row)
            .collect()
    }

    async fn fetch_time_records_for_users(
        &self,
        user_ids: &[UserId],
        range: Option<DateRange>,
    ) -> DbResult<Vec<TimeRecord>> {
        let ids = raw_ids(user_ids);
        let (from, to) = range_bounds(range);
        self.fetch("fetch_time_records", USER_TIME_RECORDS_SQL, &[&ids, &from, &to])
            .await?
            .iter()
            .map(time_record_row)
            .collect()
    }

    async fn fetch_competency_progress(
        &self,
        user_ids: &[UserId],
        options: &AnalyticsOptions,
    ) -> DbResult<Vec<CompetencySummary>> {
        let ids = raw_ids(user_ids);
        let (tenant, program) = scope_params(&options.scope);
        let competencies: Option<Vec<Uuid>> = options.competency_ids.as_deref().map(raw_ids);
        self.fetch(
            "fetch_competency_progress",
            COMPETENCY_PROGRESS_SQL,
            &[&ids, &tenant, &program, &competencies],
        )
        .await?
        .iter()
        .map(competency_row)
        .collect()
    }

    async fn fetch_rotations(
        &self,
        ids: &[RotationId],
        scope: &ScopeFilter,
    ) -> DbResult<Vec<RotationRecord>> {
        let ids = raw_ids(ids);
        let (tenant, program) = scope_params(scope);
        self.fetch("fetch_rotations", ROTATIONS_SQL, &[&ids, &tenant, &program])
            .await?
            .iter()
            .map(rotation_row)
            .collect()
    }

    async fn fetch_time_records_for_rotations(
        &self,
        rotation_ids: &[RotationId],
        range: Option<DateRange>,
    ) -> DbResult<Vec<TimeRecord>> {
        let ids = raw_ids(rotation_ids);
        let (from, to) = range_bounds(range);
        self.fetch(
            "fetch_time_records",
            ROTATION_TIME_RECORDS_SQL,
            &[&ids, &from, &to],
        )
        .await?
        .iter()
        .map(time_record_row)
        .collect()
    }
}
