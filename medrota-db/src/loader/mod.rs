//! Batch Loader
//!
//! Loads a whole set of records and their opted-in child relations with a
//! fixed number of round trips: one primary query for every id, then one
//! query per requested relation, fanned out concurrently on separate pooled
//! connections and merged by parent key. Results are cached by a canonical
//! key of `{operation, ids, options}`.
//!
//! Query failures propagate; cache failures are logged and the uncached
//! result is returned.

mod key;
mod postgres;
mod source;

pub use key::{CacheKey, LoadOperation};
pub use source::RecordSource;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::try_join_all;
use medrota_core::{
    canonical_ids, group_by_parent, group_by_rotation, merge_relation, AnalyticsOptions,
    ChildRows, CompetencyAnalytics, CompetencySummary, DateRange, ProgressOptions, Relation,
    RotationId, RotationOptions, RotationOverview, UserId, UserProgress,
};
use medrota_storage::{CacheStats, TtlCache};
use tokio::time::Instant;

use crate::error::DbResult;
use crate::pool::{ConnectionManager, Pool, PooledConnection};
use crate::telemetry::metrics::with_metrics;

/// Value stored in the loader cache.
#[derive(Debug, Clone)]
pub enum CachedResult {
    Progress(Arc<Vec<UserProgress>>),
    Analytics(Arc<Vec<CompetencyAnalytics>>),
    Rotations(Arc<Vec<RotationOverview>>),
}

pub struct BatchLoader<M: ConnectionManager> {
    pool: Pool<M>,
    cache: Arc<TtlCache<CachedResult>>,
}

impl<M: ConnectionManager> Clone for BatchLoader<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<M> BatchLoader<M>
where
    M: ConnectionManager,
    M::Connection: RecordSource,
{
    pub fn new(pool: Pool<M>, cache: Arc<TtlCache<CachedResult>>) -> Self {
        Self { pool, cache }
    }

    pub fn cache(&self) -> &Arc<TtlCache<CachedResult>> {
        &self.cache
    }

    /// Users joined with their program, plus every relation in
    /// `options.relations`. Returned in ascending user id order.
    pub async fn load_user_progress(
        &self,
        user_ids: &[UserId],
        options: &ProgressOptions,
    ) -> DbResult<Vec<UserProgress>> {
        let operation = LoadOperation::UserProgress;
        let ids = canonical_ids(user_ids);
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let key = CacheKey::derive(operation, &ids, options)?;
        if let Some(CachedResult::Progress(hit)) = self.lookup(operation, &key) {
            return Ok(hit.as_ref().clone());
        }

        let users = {
            let mut conn = self.pool.acquire().await?;
            let started = Instant::now();
            let result = conn.fetch_users(&ids, &options.scope).await;
            record_round_trip(&mut conn, operation, "users", started, result)?
        };

        let mut progress: Vec<UserProgress> = users.into_iter().map(UserProgress::new).collect();
        progress.sort_by_key(|p| p.user.user_id);

        if !progress.is_empty() && !options.relations.is_empty() {
            let parent_ids: Vec<UserId> = progress.iter().map(|p| p.user.user_id).collect();
            let fetches = options
                .relations
                .iter()
                .map(|relation| self.fetch_children(relation, &parent_ids, options.date_range));
            for rows in try_join_all(fetches).await? {
                match rows {
                    ChildRows::Submissions(rows) => {
                        merge_relation(&mut progress, group_by_parent(rows), ChildRows::Submissions)
                    }
                    ChildRows::Evaluations(rows) => {
                        merge_relation(&mut progress, group_by_parent(rows), ChildRows::Evaluations)
                    }
                    ChildRows::TimeRecords(rows) => {
                        merge_relation(&mut progress, group_by_parent(rows), ChildRows::TimeRecords)
                    }
                }
            }
        }

        tracing::debug!(
            requested = ids.len(),
            found = progress.len(),
            relations = options.relations.len(),
            "Loaded user progress"
        );
        self.fill(operation, key, CachedResult::Progress(Arc::new(progress.clone())));
        Ok(progress)
    }

    async fn fetch_children(
        &self,
        relation: Relation,
        user_ids: &[UserId],
        range: Option<DateRange>,
    ) -> DbResult<ChildRows> {
        let mut conn = self.pool.acquire().await?;
        let started = Instant::now();
        let result = match relation {
            Relation::Submissions => conn
                .fetch_submissions(user_ids, range)
                .await
                .map(ChildRows::Submissions),
            Relation::Evaluations => conn
                .fetch_evaluations(user_ids, range)
                .await
                .map(ChildRows::Evaluations),
            Relation::TimeRecords => conn
                .fetch_time_records_for_users(user_ids, range)
                .await
                .map(ChildRows::TimeRecords),
        };
        record_round_trip(
            &mut conn,
            LoadOperation::UserProgress,
            relation.as_str(),
            started,
            result,
        )
    }

    /// Per-user competency roll-ups from `mv_user_competency_progress`, one
    /// query for the whole set. Users without rows in the view are omitted.
    pub async fn load_competency_analytics(
        &self,
        user_ids: &[UserId],
        options: &AnalyticsOptions,
    ) -> DbResult<Vec<CompetencyAnalytics>> {
        let operation = LoadOperation::CompetencyAnalytics;
        let ids = canonical_ids(user_ids);
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let options = options.canonical();

        let key = CacheKey::derive(operation, &ids, &options)?;
        if let Some(CachedResult::Analytics(hit)) = self.lookup(operation, &key) {
            return Ok(hit.as_ref().clone());
        }

        let rows = {
            let mut conn = self.pool.acquire().await?;
            let started = Instant::now();
            let result = conn.fetch_competency_progress(&ids, &options).await;
            record_round_trip(&mut conn, operation, "competency_progress", started, result)?
        };

        let mut by_user: BTreeMap<UserId, Vec<CompetencySummary>> = BTreeMap::new();
        for row in rows {
            by_user.entry(row.user_id).or_default().push(row);
        }
        let analytics: Vec<CompetencyAnalytics> = by_user
            .into_iter()
            .map(|(user_id, summaries)| CompetencyAnalytics::from_summaries(user_id, summaries))
            .collect();

        self.fill(operation, key, CachedResult::Analytics(Arc::new(analytics.clone())));
        Ok(analytics)
    }

    /// Rotations with program and summary data, plus time records when
    /// requested. Returned in ascending rotation id order.
    pub async fn load_rotation_overviews(
        &self,
        rotation_ids: &[RotationId],
        options: &RotationOptions,
    ) -> DbResult<Vec<RotationOverview>> {
        let operation = LoadOperation::RotationOverview;
        let ids = canonical_ids(rotation_ids);
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let key = CacheKey::derive(operation, &ids, options)?;
        if let Some(CachedResult::Rotations(hit)) = self.lookup(operation, &key) {
            return Ok(hit.as_ref().clone());
        }

        let rotations = {
            let mut conn = self.pool.acquire().await?;
            let started = Instant::now();
            let result = conn.fetch_rotations(&ids, &options.scope).await;
            record_round_trip(&mut conn, operation, "rotations", started, result)?
        };

        let mut overviews: Vec<RotationOverview> =
            rotations.into_iter().map(RotationOverview::new).collect();
        overviews.sort_by_key(|o| o.rotation.rotation_id);

        if options.include_time_records && !overviews.is_empty() {
            let parent_ids: Vec<RotationId> =
                overviews.iter().map(|o| o.rotation.rotation_id).collect();
            let rows = {
                let mut conn = self.pool.acquire().await?;
                let started = Instant::now();
                let result = conn
                    .fetch_time_records_for_rotations(&parent_ids, options.date_range)
                    .await;
                record_round_trip(
                    &mut conn,
                    operation,
                    Relation::TimeRecords.as_str(),
                    started,
                    result,
                )?
            };
            let mut grouped = group_by_rotation(rows);
            for overview in overviews.iter_mut() {
                let rows = grouped
                    .remove(&overview.rotation.rotation_id)
                    .unwrap_or_default();
                overview.apply_time_records(rows);
            }
        }

        self.fill(operation, key, CachedResult::Rotations(Arc::new(overviews.clone())));
        Ok(overviews)
    }

    /// Drop every cached user progress and analytics entry.
    ///
    /// Invalidation is coarse: any write touching a user clears both
    /// operations for all users. Returns the number of entries removed.
    pub fn invalidate_users(&self, user_ids: &[UserId]) -> usize {
        let removed: usize = [
            LoadOperation::UserProgress,
            LoadOperation::CompetencyAnalytics,
        ]
        .iter()
        .map(|op| self.cache.remove_prefix(&op.key_prefix()))
        .sum();
        tracing::debug!(users = user_ids.len(), removed, "Invalidated cached user loads");
        removed
    }

    pub fn clear_cache(&self) -> usize {
        let removed = self.cache.clear();
        tracing::info!(removed, "Cleared loader cache");
        removed
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn lookup(&self, operation: LoadOperation, key: &CacheKey) -> Option<CachedResult> {
        let hit = self.cache.get(key.as_str());
        with_metrics(|m| m.record_cache_lookup(operation.as_str(), hit.is_some()));
        if hit.is_some() {
            tracing::trace!(operation = operation.as_str(), key = %key, "Loader cache hit");
        }
        hit
    }

    fn fill(&self, operation: LoadOperation, key: CacheKey, value: CachedResult) {
        if let Err(e) = self.cache.insert(key.into_string(), value) {
            tracing::warn!(
                operation = operation.as_str(),
                error = %e,
                "Cache fill failed, returning uncached result"
            );
        }
    }
}

/// Record one round trip and evict the connection on transport failure.
fn record_round_trip<M: ConnectionManager, T>(
    conn: &mut PooledConnection<M>,
    operation: LoadOperation,
    relation: &str,
    started: Instant,
    result: DbResult<T>,
) -> DbResult<T> {
    let elapsed = started.elapsed().as_secs_f64();
    with_metrics(|m| m.record_query(operation.as_str(), relation, result.is_ok(), elapsed));
    if let Err(e) = &result {
        if e.is_connection_fatal() {
            conn.mark_broken();
        }
        tracing::warn!(
            operation = operation.as_str(),
            relation,
            error = %e,
            "Batch load query failed"
        );
    }
    result
}
