//! Batch loader properties against the instrumented in-memory backend.
//!
//! Round trips depend only on the requested relations, never on how many
//! ids are loaded; cached results are returned without touching the
//! backend until their TTL elapses.

use std::sync::Arc;
use std::time::Duration;

use medrota_db::{BatchLoader, DbError, Pool};
use medrota_storage::{CacheStoreConfig, TtlCache};
use medrota_test_utils::assertions::{assert_ascending_users, assert_relations_loaded};
use medrota_test_utils::fixtures::{day, program, tenant, test_pool_config, Dataset};
use medrota_test_utils::generators::arb_relation_set;
use medrota_test_utils::{
    AnalyticsOptions, DateRange, EntityIdType, Failure, MockBackend, MockManager, ProgressOptions,
    QueryKind, Relation, RelationSet, RotationOptions, ScopeFilter, TenantId, UserId,
};
use proptest::prelude::*;

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

const TTL: Duration = Duration::from_secs(300);

fn loader(dataset: Dataset) -> (BatchLoader<MockManager>, Arc<MockBackend>) {
    let manager = MockManager::new(dataset);
    let backend = manager.backend();
    let pool = Pool::new(manager, test_pool_config(8)).unwrap();
    let cache = Arc::new(TtlCache::new(CacheStoreConfig::new().with_ttl(TTL)));
    (BatchLoader::new(pool, cache), backend)
}

// ============================================================================
// ROUND TRIPS
// ============================================================================

#[tokio::test]
async fn test_two_hundred_users_with_three_relations_take_four_queries() {
    let dataset = Dataset::generate(200, 3);
    let ids = dataset.user_ids();
    let (loader, backend) = loader(dataset);

    let progress = loader
        .load_user_progress(&ids, &ProgressOptions::new().include_all())
        .await
        .unwrap();

    assert_eq!(progress.len(), 200);
    assert_eq!(backend.queries(), 4);
    for kind in [
        QueryKind::Users,
        QueryKind::Submissions,
        QueryKind::Evaluations,
        QueryKind::UserTimeRecords,
    ] {
        assert_eq!(backend.queries_for(kind), 1, "{kind:?}");
    }
    assert_ascending_users(&progress);
    assert_relations_loaded(&progress, RelationSet::all());
    assert!(progress
        .iter()
        .all(|p| p.submissions.as_ref().map(Vec::len) == Some(3)));
}

#[tokio::test(start_paused = true)]
async fn test_child_queries_run_concurrently() {
    let dataset = Dataset::generate(10, 1);
    let ids = dataset.user_ids();
    let (loader, backend) = loader(dataset);
    backend.set_query_delay(Duration::from_millis(100));

    let started = tokio::time::Instant::now();
    loader
        .load_user_progress(&ids, &ProgressOptions::new().include_all())
        .await
        .unwrap();

    assert_eq!(backend.peak_in_flight(), 3);
    assert!(started.elapsed() < Duration::from_millis(250));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Query count is `1 + relations` for any non-empty id set.
    #[test]
    fn prop_round_trips_independent_of_n(n in 0usize..150, relations in arb_relation_set()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let dataset = Dataset::generate(n, 1);
            let mut ids = dataset.user_ids();
            // Duplicates must not change anything
            ids.extend(ids.clone().into_iter().take(3));
            let (loader, backend) = loader(dataset);
            let options = ProgressOptions { relations, ..ProgressOptions::default() };

            let progress = loader.load_user_progress(&ids, &options).await.unwrap();

            let expected = if n == 0 { 0 } else { 1 + relations.len() };
            prop_assert_eq!(backend.queries(), expected);
            prop_assert_eq!(progress.len(), n);
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn test_empty_id_set_returns_empty_without_round_trips() {
    let (loader, backend) = loader(Dataset::generate(5, 1));
    assert!(loader
        .load_user_progress(&[], &ProgressOptions::new().include_all())
        .await
        .unwrap()
        .is_empty());
    assert!(loader
        .load_competency_analytics(&[], &AnalyticsOptions::new())
        .await
        .unwrap()
        .is_empty());
    assert!(loader
        .load_rotation_overviews(&[], &RotationOptions::new().with_time_records())
        .await
        .unwrap()
        .is_empty());
    assert_eq!(backend.queries(), 0);
}

// ============================================================================
// CACHE
// ============================================================================

#[tokio::test]
async fn test_second_identical_load_is_served_from_cache() {
    let dataset = Dataset::generate(20, 2);
    let ids = dataset.user_ids();
    let (loader, backend) = loader(dataset);
    let options = ProgressOptions::new().include(Relation::Submissions);

    let first = loader.load_user_progress(&ids, &options).await.unwrap();
    assert_eq!(backend.queries(), 2);

    let second = loader.load_user_progress(&ids, &options).await.unwrap();
    assert_eq!(backend.queries(), 2);
    assert_eq!(first, second);
    assert_eq!(loader.cache_stats().hits, 1);
}

#[tokio::test]
async fn test_permuted_and_duplicated_ids_share_a_cache_entry() {
    let dataset = Dataset::generate(6, 1);
    let ids = dataset.user_ids();
    let (loader, backend) = loader(dataset);

    let mut shuffled: Vec<UserId> = ids.iter().rev().copied().collect();
    shuffled.push(ids[2]);

    let first = loader
        .load_user_progress(&ids, &ProgressOptions::new())
        .await
        .unwrap();
    let second = loader
        .load_user_progress(&shuffled, &ProgressOptions::new())
        .await
        .unwrap();
    assert_eq!(backend.queries(), 1);
    assert_eq!(first, second);
}

#[tokio::test(start_paused = true)]
async fn test_cached_result_expires_after_ttl() {
    let dataset = Dataset::generate(4, 1);
    let ids = dataset.user_ids();
    let (loader, backend) = loader(dataset);
    let options = ProgressOptions::new();

    loader.load_user_progress(&ids, &options).await.unwrap();
    tokio::time::advance(TTL - Duration::from_secs(1)).await;
    loader.load_user_progress(&ids, &options).await.unwrap();
    assert_eq!(backend.queries(), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    loader.load_user_progress(&ids, &options).await.unwrap();
    assert_eq!(backend.queries(), 2);
}

#[tokio::test]
async fn test_invalidate_users_forces_a_reload() {
    let dataset = Dataset::generate(4, 1);
    let ids = dataset.user_ids();
    let (loader, backend) = loader(dataset);

    loader
        .load_user_progress(&ids, &ProgressOptions::new())
        .await
        .unwrap();
    loader
        .load_competency_analytics(&ids, &AnalyticsOptions::new())
        .await
        .unwrap();
    assert_eq!(loader.invalidate_users(&ids[..1]), 2);

    loader
        .load_user_progress(&ids, &ProgressOptions::new())
        .await
        .unwrap();
    assert_eq!(backend.queries(), 3);
}

// ============================================================================
// MERGE AND FILTERS
// ============================================================================

#[tokio::test]
async fn test_users_without_rows_get_empty_collections() {
    let mut dataset = Dataset::generate(3, 2);
    let bare = dataset.users[1].user_id;
    dataset.submissions.retain(|s| s.user_id != bare);
    let ids = dataset.user_ids();
    let (loader, _) = loader(dataset);

    let progress = loader
        .load_user_progress(&ids, &ProgressOptions::new().include(Relation::Submissions))
        .await
        .unwrap();
    let bare_progress = progress.iter().find(|p| p.user.user_id == bare).unwrap();
    assert_eq!(bare_progress.submissions, Some(Vec::new()));
    assert!(bare_progress.evaluations.is_none());
}

#[tokio::test]
async fn test_date_range_limits_child_rows() {
    let dataset = Dataset::generate(2, 5);
    let ids = dataset.user_ids();
    let (loader, _) = loader(dataset);
    let range = DateRange::new(day(1), day(2)).unwrap();

    let progress = loader
        .load_user_progress(
            &ids,
            &ProgressOptions::new()
                .include(Relation::TimeRecords)
                .with_date_range(range),
        )
        .await
        .unwrap();
    for p in &progress {
        let records = p.time_records.as_ref().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| range.contains(r.clock_in)));
    }
}

#[tokio::test]
async fn test_tenant_and_program_scope_filter_primary_rows() {
    let dataset = Dataset::generate(6, 2);
    let ids = dataset.user_ids();
    let (loader, backend) = loader(dataset);

    let scoped = ProgressOptions::new()
        .with_scope(ScopeFilter::tenant(tenant()).with_program(program(1)))
        .include(Relation::Submissions);
    let progress = loader.load_user_progress(&ids, &scoped).await.unwrap();
    assert_eq!(progress.len(), 3);
    assert!(progress
        .iter()
        .all(|p| p.user.program_id == Some(program(1))));
    assert!(progress
        .iter()
        .all(|p| p.submissions.as_ref().map(Vec::len) == Some(2)));
    assert_eq!(backend.queries(), 2);

    backend.reset_counts();
    let elsewhere = ProgressOptions::new()
        .with_scope(ScopeFilter::tenant(TenantId::now_v7()))
        .include(Relation::Submissions);
    let progress = loader.load_user_progress(&ids, &elsewhere).await.unwrap();
    assert!(progress.is_empty());
    // No parents, so no child query.
    assert_eq!(backend.queries(), 1);
}

#[tokio::test]
async fn test_analytics_omit_users_without_view_rows() {
    let mut dataset = Dataset::generate(3, 3);
    let missing = dataset.users[0].user_id;
    dataset.competency_progress.retain(|c| c.user_id != missing);
    let mut ids = dataset.user_ids();
    ids.push(UserId::now_v7());
    let (loader, backend) = loader(dataset);

    let analytics = loader
        .load_competency_analytics(&ids, &AnalyticsOptions::new())
        .await
        .unwrap();
    assert_eq!(backend.queries(), 1);
    assert_eq!(analytics.len(), 2);
    assert!(analytics.iter().all(|a| a.user_id != missing));
    assert!(analytics.windows(2).all(|w| w[0].user_id < w[1].user_id));
    assert!(analytics.iter().all(|a| a.competencies.len() == 3));
}

#[tokio::test]
async fn test_analytics_competency_filter() {
    let dataset = Dataset::generate(2, 3);
    let ids = dataset.user_ids();
    let wanted = dataset.competency_progress[0].competency_id;
    let (loader, _) = loader(dataset);

    let analytics = loader
        .load_competency_analytics(&ids, &AnalyticsOptions::new().with_competencies(&[wanted]))
        .await
        .unwrap();
    assert!(analytics
        .iter()
        .all(|a| a.competencies.iter().all(|c| c.competency_id == wanted)));
}

#[tokio::test]
async fn test_rotation_overviews_with_time_records_take_two_queries() {
    let dataset = Dataset::generate(9, 2);
    let rotation_ids = dataset.rotation_ids();
    let (loader, backend) = loader(dataset);

    let overviews = loader
        .load_rotation_overviews(&rotation_ids, &RotationOptions::new().with_time_records())
        .await
        .unwrap();

    assert_eq!(backend.queries(), 2);
    assert_eq!(overviews.len(), 3);
    let hours: usize = overviews
        .iter()
        .map(|o| o.time_records.as_ref().map_or(0, Vec::len))
        .sum();
    assert_eq!(hours, 18);
}

// ============================================================================
// FAILURES
// ============================================================================

#[tokio::test]
async fn test_child_query_failure_propagates_and_is_not_cached() {
    let dataset = Dataset::generate(4, 1);
    let ids = dataset.user_ids();
    let (loader, backend) = loader(dataset);
    backend.fail(QueryKind::Evaluations, Failure::Query);

    let err = loader
        .load_user_progress(&ids, &ProgressOptions::new().include_all())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Query { .. }));
    assert!(!err.is_retryable());
    assert_eq!(loader.cache_stats().entry_count, 0);

    backend.clear_failures();
    loader
        .load_user_progress(&ids, &ProgressOptions::new().include_all())
        .await
        .unwrap();
    assert_eq!(loader.cache_stats().entry_count, 1);
}

#[tokio::test]
async fn test_transport_failure_evicts_the_connection() {
    let dataset = Dataset::generate(4, 1);
    let ids = dataset.user_ids();
    let manager = MockManager::new(dataset);
    let backend = manager.backend();
    let pool = Pool::new(manager, test_pool_config(4)).unwrap();
    let loader = BatchLoader::new(
        pool.clone(),
        Arc::new(TtlCache::new(CacheStoreConfig::new().with_ttl(TTL))),
    );
    backend.fail(QueryKind::Users, Failure::Connection);

    let err = loader
        .load_user_progress(&ids, &ProgressOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Connection { .. }));
    let metrics = pool.metrics();
    assert_eq!(metrics.total, 0);
    assert_eq!(metrics.destroyed, 1);
}
