//! Medrota Test Utilities
//!
//! Shared test infrastructure for the Medrota workspace:
//! - An instrumented in-memory backend (`MockManager`) that counts every
//!   round trip, tracks concurrency, and injects failures
//! - A synthetic pool for driving the scaling controller
//! - Proptest generators for ids, options, and pool signals
//! - Dataset fixtures for common scenarios
//! - Assertions for pool and loader invariants

// Re-export the types most tests touch
pub use medrota_core::{
    canonical_ids, AnalyticsOptions, CompetencyAnalytics, CompetencySummary, DateRange,
    EntityIdType, EvaluationRecord, ProgramId, ProgressOptions, Relation, RelationSet,
    RotationId, RotationOptions, RotationOverview, RotationRecord, ScopeFilter,
    SubmissionRecord, SubmissionStatus, TenantId, TimeRecord, Timestamp, UserId, UserProgress,
    UserRecord, UserRole,
};
pub use medrota_db::{
    BatchConfig, ConnectionManager, DbError, DbResult, PoolConfig, PoolMetrics, PoolSample,
    RecordSource, ScalablePool, ScalingConfig, ServiceConfig, SessionGuards,
};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// MOCK BACKEND
// ============================================================================

/// One statement shape of the row source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueryKind {
    Users,
    Submissions,
    Evaluations,
    UserTimeRecords,
    CompetencyProgress,
    Rotations,
    RotationTimeRecords,
    Ping,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Users => "fetch_users",
            QueryKind::Submissions => "fetch_submissions",
            QueryKind::Evaluations => "fetch_evaluations",
            QueryKind::UserTimeRecords => "fetch_time_records_for_users",
            QueryKind::CompetencyProgress => "fetch_competency_progress",
            QueryKind::Rotations => "fetch_rotations",
            QueryKind::RotationTimeRecords => "fetch_time_records_for_rotations",
            QueryKind::Ping => "ping",
        }
    }
}

/// Failure injected into a query kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Statement error; the connection stays usable
    Query,
    /// Transport error; the connection should be evicted
    Connection,
}

impl Failure {
    fn to_error(self, kind: QueryKind) -> DbError {
        match self {
            Failure::Query => DbError::query(kind.as_str(), "injected statement failure"),
            Failure::Connection => DbError::connection("injected transport failure"),
        }
    }
}

/// Shared state behind every [`MockConnection`].
///
/// Rows come from a [`fixtures::Dataset`]; every row-source call counts as
/// one round trip whether it succeeds or not.
#[derive(Debug, Default)]
pub struct MockBackend {
    dataset: RwLock<fixtures::Dataset>,
    queries: Mutex<BTreeMap<QueryKind, usize>>,
    failures: Mutex<BTreeMap<QueryKind, Failure>>,
    query_delay: Mutex<Duration>,
    connects: AtomicUsize,
    guards_applied: AtomicUsize,
    last_guards: Mutex<Option<SessionGuards>>,
    fail_connect: AtomicBool,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    generation: AtomicU64,
}

impl MockBackend {
    pub fn new(dataset: fixtures::Dataset) -> Self {
        Self {
            dataset: RwLock::new(dataset),
            ..Self::default()
        }
    }

    pub fn set_dataset(&self, dataset: fixtures::Dataset) {
        *self.dataset.write().unwrap_or_else(PoisonError::into_inner) = dataset;
    }

    /// Every query and ping sleeps for `delay` before answering.
    pub fn set_query_delay(&self, delay: Duration) {
        *lock(&self.query_delay) = delay;
    }

    pub fn fail(&self, kind: QueryKind, failure: Failure) {
        lock(&self.failures).insert(kind, failure);
    }

    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Report every connection opened so far as broken.
    pub fn kill_connections(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Row-source round trips, pings excluded.
    pub fn queries(&self) -> usize {
        lock(&self.queries)
            .iter()
            .filter(|(kind, _)| **kind != QueryKind::Ping)
            .map(|(_, n)| n)
            .sum()
    }

    pub fn queries_for(&self, kind: QueryKind) -> usize {
        lock(&self.queries).get(&kind).copied().unwrap_or(0)
    }

    pub fn reset_counts(&self) {
        lock(&self.queries).clear();
        self.peak_in_flight.store(0, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn guards_applied(&self) -> usize {
        self.guards_applied.load(Ordering::SeqCst)
    }

    pub fn last_guards(&self) -> Option<SessionGuards> {
        *lock(&self.last_guards)
    }

    /// Highest number of queries observed running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn run<T: Send>(
        &self,
        kind: QueryKind,
        rows: impl FnOnce(&fixtures::Dataset) -> Vec<T> + Send,
    ) -> DbResult<Vec<T>> {
        *lock(&self.queries).entry(kind).or_insert(0) += 1;
        let _flight = InFlight::enter(self);

        let delay = *lock(&self.query_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(failure) = lock(&self.failures).get(&kind).copied() {
            return Err(failure.to_error(kind));
        }
        let dataset = self.dataset.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows(&dataset))
    }
}

struct InFlight<'a> {
    backend: &'a MockBackend,
}

impl<'a> InFlight<'a> {
    fn enter(backend: &'a MockBackend) -> Self {
        let now = backend.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        backend.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self { backend }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.backend.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Connection manager over a shared [`MockBackend`].
#[derive(Debug, Clone)]
pub struct MockManager {
    backend: Arc<MockBackend>,
}

impl MockManager {
    pub fn new(dataset: fixtures::Dataset) -> Self {
        Self {
            backend: Arc::new(MockBackend::new(dataset)),
        }
    }

    pub fn empty() -> Self {
        Self::new(fixtures::Dataset::default())
    }

    /// Handle for inspecting counters after the manager moves into a pool.
    pub fn backend(&self) -> Arc<MockBackend> {
        Arc::clone(&self.backend)
    }
}

#[derive(Debug)]
pub struct MockConnection {
    backend: Arc<MockBackend>,
    generation: u64,
}

#[async_trait]
impl ConnectionManager for MockManager {
    type Connection = MockConnection;

    async fn connect(&self) -> DbResult<MockConnection> {
        if self.backend.fail_connect.load(Ordering::SeqCst) {
            return Err(DbError::connection("connection refused"));
        }
        self.backend.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            backend: Arc::clone(&self.backend),
            generation: self.backend.generation.load(Ordering::SeqCst),
        })
    }

    async fn apply_session_guards(
        &self,
        _conn: &mut MockConnection,
        guards: &SessionGuards,
    ) -> DbResult<()> {
        self.backend.guards_applied.fetch_add(1, Ordering::SeqCst);
        *lock(&self.backend.last_guards) = Some(*guards);
        Ok(())
    }

    async fn ping(&self, conn: &mut MockConnection) -> DbResult<()> {
        if self.is_broken(conn) {
            return Err(DbError::connection("connection reset by peer"));
        }
        self.backend.run(QueryKind::Ping, |_| Vec::<()>::new()).await?;
        Ok(())
    }

    fn is_broken(&self, conn: &MockConnection) -> bool {
        conn.generation < self.backend.generation.load(Ordering::SeqCst)
    }
}

fn id_set<I: EntityIdType>(ids: &[I]) -> BTreeSet<I> {
    ids.iter().copied().collect()
}

fn in_range(range: Option<DateRange>, ts: Option<Timestamp>) -> bool {
    match (range, ts) {
        (None, _) => true,
        (Some(range), Some(ts)) => range.contains(ts),
        (Some(_), None) => false,
    }
}

fn in_scope(scope: &ScopeFilter, tenant_id: TenantId, program_id: Option<ProgramId>) -> bool {
    scope.tenant_id.map_or(true, |t| t == tenant_id)
        && scope.program_id.map_or(true, |p| program_id == Some(p))
}

#[async_trait]
impl RecordSource for MockConnection {
    async fn fetch_users(&self, ids: &[UserId], scope: &ScopeFilter) -> DbResult<Vec<UserRecord>> {
        let wanted = id_set(ids);
        let scope = *scope;
        self.backend
            .run(QueryKind::Users, move |data| {
                data.users
                    .iter()
                    .filter(|u| wanted.contains(&u.user_id))
                    .filter(|u| in_scope(&scope, u.tenant_id, u.program_id))
                    .cloned()
                    .collect()
            })
            .await
    }

    async fn fetch_submissions(
        &self,
        user_ids: &[UserId],
        range: Option<DateRange>,
    ) -> DbResult<Vec<SubmissionRecord>> {
        let wanted = id_set(user_ids);
        self.backend
            .run(QueryKind::Submissions, move |data| {
                data.submissions
                    .iter()
                    .filter(|s| wanted.contains(&s.user_id) && in_range(range, s.submitted_at))
                    .cloned()
                    .collect()
            })
            .await
    }

    async fn fetch_evaluations(
        &self,
        user_ids: &[UserId],
        range: Option<DateRange>,
    ) -> DbResult<Vec<EvaluationRecord>> {
        let wanted = id_set(user_ids);
        self.backend
            .run(QueryKind::Evaluations, move |data| {
                data.evaluations
                    .iter()
                    .filter(|e| wanted.contains(&e.user_id) && in_range(range, e.completed_at))
                    .cloned()
                    .collect()
            })
            .await
    }

    async fn fetch_time_records_for_users(
        &self,
        user_ids: &[UserId],
        range: Option<DateRange>,
    ) -> DbResult<Vec<TimeRecord>> {
        let wanted = id_set(user_ids);
        self.backend
            .run(QueryKind::UserTimeRecords, move |data| {
                data.time_records
                    .iter()
                    .filter(|t| wanted.contains(&t.user_id) && in_range(range, Some(t.clock_in)))
                    .cloned()
                    .collect()
            })
            .await
    }

    async fn fetch_competency_progress(
        &self,
        user_ids: &[UserId],
        options: &AnalyticsOptions,
    ) -> DbResult<Vec<CompetencySummary>> {
        let wanted = id_set(user_ids);
        let options = options.clone();
        self.backend
            .run(QueryKind::CompetencyProgress, move |data| {
                let scoped: BTreeSet<UserId> = data
                    .users
                    .iter()
                    .filter(|u| in_scope(&options.scope, u.tenant_id, u.program_id))
                    .map(|u| u.user_id)
                    .collect();
                data.competency_progress
                    .iter()
                    .filter(|c| wanted.contains(&c.user_id) && scoped.contains(&c.user_id))
                    .filter(|c| {
                        options
                            .competency_ids
                            .as_ref()
                            .map_or(true, |ids| ids.contains(&c.competency_id))
                    })
                    .cloned()
                    .collect()
            })
            .await
    }

    async fn fetch_rotations(
        &self,
        ids: &[RotationId],
        scope: &ScopeFilter,
    ) -> DbResult<Vec<RotationRecord>> {
        let wanted = id_set(ids);
        let scope = *scope;
        self.backend
            .run(QueryKind::Rotations, move |data| {
                data.rotations
                    .iter()
                    .filter(|r| wanted.contains(&r.rotation_id))
                    .filter(|r| in_scope(&scope, r.tenant_id, Some(r.program_id)))
                    .cloned()
                    .collect()
            })
            .await
    }

    async fn fetch_time_records_for_rotations(
        &self,
        rotation_ids: &[RotationId],
        range: Option<DateRange>,
    ) -> DbResult<Vec<TimeRecord>> {
        let wanted = id_set(rotation_ids);
        self.backend
            .run(QueryKind::RotationTimeRecords, move |data| {
                data.time_records
                    .iter()
                    .filter(|t| t.rotation_id.map_or(false, |r| wanted.contains(&r)))
                    .filter(|t| in_range(range, Some(t.clock_in)))
                    .cloned()
                    .collect()
            })
            .await
    }
}

// ============================================================================
// SYNTHETIC POOL
// ============================================================================

/// A [`ScalablePool`] whose pressure signal is set by the test.
///
/// `set_max_connections` calls are recorded and move `current_max`.
#[derive(Debug)]
pub struct SyntheticPool {
    sample: Mutex<PoolSample>,
    resizes: Mutex<Vec<usize>>,
    fail_resize: AtomicBool,
}

impl SyntheticPool {
    pub fn new(current_max: usize) -> Self {
        Self {
            sample: Mutex::new(PoolSample {
                utilization: 0.0,
                waiting: 0,
                active: 0,
                total: 0,
                current_max,
                avg_wait: Duration::ZERO,
            }),
            resizes: Mutex::new(Vec::new()),
            fail_resize: AtomicBool::new(false),
        }
    }

    /// Set the signal seen by the next evaluation.
    pub fn set_signal(&self, utilization: f64, waiting: usize) {
        let mut sample = lock(&self.sample);
        sample.utilization = utilization;
        sample.waiting = waiting;
        sample.total = sample.current_max;
        sample.active = (utilization * sample.current_max as f64).round() as usize;
    }

    pub fn set_fail_resize(&self, fail: bool) {
        self.fail_resize.store(fail, Ordering::SeqCst);
    }

    pub fn current_max(&self) -> usize {
        lock(&self.sample).current_max
    }

    /// Every ceiling applied, in order.
    pub fn resizes(&self) -> Vec<usize> {
        lock(&self.resizes).clone()
    }
}

impl ScalablePool for SyntheticPool {
    fn sample(&self) -> PoolSample {
        *lock(&self.sample)
    }

    fn set_max_connections(&self, max: usize) -> DbResult<usize> {
        if self.fail_resize.load(Ordering::SeqCst) {
            return Err(DbError::PoolClosed);
        }
        lock(&self.sample).current_max = max;
        lock(&self.resizes).push(max);
        Ok(max)
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    pub fn arb_user_id() -> impl Strategy<Value = UserId> {
        any::<u128>().prop_map(|n| UserId::new(Uuid::from_u128(n)))
    }

    /// Up to `max` ids, duplicates allowed.
    pub fn arb_user_ids(max: usize) -> impl Strategy<Value = Vec<UserId>> {
        prop::collection::vec(arb_user_id(), 0..=max)
    }

    pub fn arb_relation() -> impl Strategy<Value = Relation> {
        prop_oneof![
            Just(Relation::Submissions),
            Just(Relation::Evaluations),
            Just(Relation::TimeRecords),
        ]
    }

    pub fn arb_relation_set() -> impl Strategy<Value = RelationSet> {
        (any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
            |(submissions, evaluations, time_records)| RelationSet {
                submissions,
                evaluations,
                time_records,
            },
        )
    }

    pub fn arb_progress_options() -> impl Strategy<Value = ProgressOptions> {
        arb_relation_set().prop_map(|relations| ProgressOptions {
            relations,
            ..ProgressOptions::default()
        })
    }

    /// Utilization in `[0, 1]` and a waiter count, including both extremes.
    pub fn arb_pressure() -> impl Strategy<Value = (f64, usize)> {
        (
            prop_oneof![Just(0.0), Just(1.0), 0.0f64..=1.0],
            prop_oneof![Just(0usize), 0usize..50],
        )
    }

    /// A valid scaling configuration with small bounds.
    pub fn arb_scaling_config() -> impl Strategy<Value = ScalingConfig> {
        (1usize..10, 0usize..40, 1usize..10, 1usize..10, 0.05f64..0.45, 0.55f64..0.95).prop_map(
            |(min, span, up, down, low, high)| ScalingConfig {
                enabled: true,
                min_connections: min,
                max_connections: min + span,
                scale_up_threshold: high,
                scale_down_threshold: low,
                scale_up_increment: up,
                scale_down_decrement: down,
                evaluation_interval: Duration::from_secs(30),
                min_scale_interval: Duration::from_secs(60),
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;
    use chrono::{Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
    use medrota_core::{AssignmentId, CompetencyId, EvaluationId, SubmissionId, TimeRecordId};
    use uuid::Uuid;

    const COMPETENCIES: [&str; 3] = ["Patient Care", "Medical Knowledge", "Professionalism"];

    /// Rows of every table the loader reads.
    #[derive(Debug, Clone, Default)]
    pub struct Dataset {
        pub users: Vec<UserRecord>,
        pub submissions: Vec<SubmissionRecord>,
        pub evaluations: Vec<EvaluationRecord>,
        pub time_records: Vec<TimeRecord>,
        pub competency_progress: Vec<CompetencySummary>,
        pub rotations: Vec<RotationRecord>,
    }

    /// Fixed tenant shared by generated rows.
    pub fn tenant() -> TenantId {
        TenantId::new(Uuid::from_u128(0x7e4a_0001))
    }

    pub fn program(n: u128) -> ProgramId {
        ProgramId::new(Uuid::from_u128(0x9a09_0000 + n))
    }

    /// 2026-01-05T08:00:00Z plus `days`.
    pub fn day(days: i64) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0)
            .single()
            .unwrap_or_else(Utc::now)
            + ChronoDuration::days(days)
    }

    fn seq<I: EntityIdType>(space: u128, n: usize) -> I {
        I::new(Uuid::from_u128((space << 64) | n as u128))
    }

    impl Dataset {
        /// `users` residents spread over two programs and three rotations.
        /// Each has `per_user` submissions, evaluations and time records
        /// dated on consecutive days, and one view row per competency.
        pub fn generate(users: usize, per_user: usize) -> Self {
            let mut data = Dataset::default();

            for r in 0..3 {
                let program_n = (r % 2) as u128;
                data.rotations.push(RotationRecord {
                    rotation_id: seq(2, r),
                    tenant_id: tenant(),
                    program_id: program(program_n),
                    program_name: format!("Program {}", program_n),
                    name: format!("Rotation {}", r),
                    start_date: NaiveDate::from_ymd_opt(2026, 1, 5).unwrap_or_default(),
                    end_date: NaiveDate::from_ymd_opt(2026, 3, 29).unwrap_or_default(),
                    enrolled_count: 0,
                    total_hours: 0.0,
                    average_rating: None,
                });
            }

            for u in 0..users {
                let user_id: UserId = seq(1, u);
                let program_n = (u % 2) as u128;
                let rotation_id = data.rotations[u % data.rotations.len()].rotation_id;
                data.users.push(UserRecord {
                    user_id,
                    tenant_id: tenant(),
                    email: format!("resident{}@example.org", u),
                    display_name: format!("Resident {}", u),
                    role: UserRole::Resident,
                    program_id: Some(program(program_n)),
                    program_name: Some(format!("Program {}", program_n)),
                    created_at: day(-30),
                });

                for k in 0..per_user {
                    let n = u * per_user + k;
                    let competency_id: CompetencyId = seq(3, k % COMPETENCIES.len());
                    data.submissions.push(SubmissionRecord {
                        submission_id: seq::<SubmissionId>(4, n),
                        user_id,
                        assignment_id: seq::<AssignmentId>(5, n),
                        competency_id,
                        competency_name: COMPETENCIES[k % COMPETENCIES.len()].to_string(),
                        status: if k % 2 == 0 {
                            SubmissionStatus::Approved
                        } else {
                            SubmissionStatus::Submitted
                        },
                        score: Some(3.0 + (k % 3) as f64 * 0.5),
                        submitted_at: Some(day(k as i64)),
                    });
                    data.evaluations.push(EvaluationRecord {
                        evaluation_id: seq::<EvaluationId>(6, n),
                        user_id,
                        evaluator_id: seq(7, 0),
                        evaluator_name: "Attending".to_string(),
                        rotation_id: Some(rotation_id),
                        rating: Some(4.0),
                        comments: None,
                        completed_at: Some(day(k as i64)),
                    });
                    data.time_records.push(TimeRecord {
                        time_record_id: seq::<TimeRecordId>(8, n),
                        user_id,
                        rotation_id: Some(rotation_id),
                        clock_in: day(k as i64),
                        clock_out: Some(day(k as i64) + ChronoDuration::hours(10)),
                        hours: 10.0,
                        approved: k % 2 == 0,
                    });
                }

                for (c, name) in COMPETENCIES.iter().enumerate() {
                    let total = per_user.div_ceil(COMPETENCIES.len()).max(1) as i64;
                    data.competency_progress.push(CompetencySummary {
                        user_id,
                        competency_id: seq(3, c),
                        competency_name: name.to_string(),
                        total_assignments: total,
                        completed_assignments: total / 2,
                        average_score: Some(3.5),
                        last_activity_at: Some(day(c as i64)),
                    });
                }
            }

            data
        }

        pub fn user_ids(&self) -> Vec<UserId> {
            self.users.iter().map(|u| u.user_id).collect()
        }

        pub fn rotation_ids(&self) -> Vec<RotationId> {
            self.rotations.iter().map(|r| r.rotation_id).collect()
        }
    }

    /// Pool configuration for tests: lazy, small, quick to time out.
    pub fn test_pool_config(max: usize) -> PoolConfig {
        PoolConfig::default()
            .with_bounds(0, max)
            .with_connection_timeout(Duration::from_millis(200))
    }

    /// Service configuration around [`test_pool_config`], scaling off.
    pub fn test_service_config(max: usize) -> ServiceConfig {
        ServiceConfig {
            pool: test_pool_config(max),
            batch: BatchConfig::new(10, 2),
            ..ServiceConfig::default()
        }
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    use super::*;

    /// `idle + active == total` and `total <= max_connections`.
    pub fn assert_pool_invariant(metrics: &PoolMetrics) {
        assert_eq!(
            metrics.idle + metrics.active,
            metrics.total,
            "idle + active must equal total: {:?}",
            metrics
        );
        assert!(
            metrics.total <= metrics.max_connections,
            "total {} exceeds max {}",
            metrics.total,
            metrics.max_connections
        );
    }

    pub fn assert_ascending_users(progress: &[UserProgress]) {
        assert!(
            progress.windows(2).all(|w| w[0].user.user_id < w[1].user.user_id),
            "progress records not in ascending user id order"
        );
    }

    /// Every requested relation is loaded, every other one left `None`.
    pub fn assert_relations_loaded(progress: &[UserProgress], relations: RelationSet) {
        for p in progress {
            assert_eq!(p.submissions.is_some(), relations.submissions);
            assert_eq!(p.evaluations.is_some(), relations.evaluations);
            assert_eq!(p.time_records.is_some(), relations.time_records);
        }
    }
}
