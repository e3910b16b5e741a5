//! Service lifecycle: lazy construction, warm-up, background jobs, shutdown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use medrota_db::{BatchConfig, DbError, DbService, ScalingConfig};
use medrota_test_utils::fixtures::{test_service_config, Dataset};
use medrota_test_utils::{MockBackend, MockManager, ProgressOptions, Relation, ServiceConfig};

fn service(config: ServiceConfig) -> (DbService<MockManager>, Dataset, Arc<MockBackend>) {
    let dataset = Dataset::generate(12, 2);
    let manager = MockManager::new(dataset.clone());
    let backend = manager.backend();
    (DbService::new(manager, config).unwrap(), dataset, backend)
}

fn warm_config() -> ServiceConfig {
    let mut config = test_service_config(5);
    config.pool = config.pool.with_bounds(2, 5);
    config
}

#[tokio::test]
async fn test_new_does_not_connect_and_start_warms_to_min() {
    let (service, _, backend) = service(warm_config());
    assert_eq!(backend.connects(), 0);

    service.start().await.unwrap();
    assert_eq!(backend.connects(), 2);
    assert_eq!(service.get_metrics().pool.idle, 2);

    service.start().await.unwrap();
    assert_eq!(backend.connects(), 2);

    service.shutdown().await;
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let mut config = test_service_config(5);
    config.batch = BatchConfig::new(0, 2);
    let manager = MockManager::empty();
    assert!(matches!(
        DbService::new(manager, config),
        Err(DbError::Config(_))
    ));
}

#[tokio::test]
async fn test_loads_and_cache_through_the_service() {
    let (service, dataset, backend) = service(test_service_config(4));
    let ids = dataset.user_ids();
    let options = ProgressOptions::new().include(Relation::Evaluations);

    let first = service.load_user_progress(&ids, &options).await.unwrap();
    let second = service.load_user_progress(&ids, &options).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(backend.queries(), 2);
    assert_eq!(service.cache_stats().entry_count, 1);

    assert_eq!(service.clear_cache(), 1);
    service.load_user_progress(&ids, &options).await.unwrap();
    assert_eq!(backend.queries(), 4);
}

#[tokio::test]
async fn test_process_batches_with_and_without_override() {
    let (service, _, _) = service(test_service_config(4));

    let doubled = service
        .process_batches(
            (1..=25u32).collect(),
            |chunk, _| async move { Ok::<_, DbError>(chunk.into_iter().map(|n| n * 2).collect()) },
            None,
        )
        .await
        .unwrap();
    assert_eq!(doubled.len(), 25);
    assert_eq!(doubled[24], 50);

    let sizes = Mutex::new(Vec::new());
    service
        .process_batches(
            vec![0u8; 7],
            |chunk, _| {
                sizes.lock().unwrap().push(chunk.len());
                async move { Ok::<_, DbError>(chunk) }
            },
            Some(BatchConfig::new(3, 1)),
        )
        .await
        .unwrap();
    assert_eq!(sizes.into_inner().unwrap(), vec![3, 3, 1]);

    let err = service
        .process_batches(
            vec![1u8],
            |chunk, _| async move { Ok::<_, DbError>(chunk) },
            Some(BatchConfig::new(0, 1)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Config(_)));
}

#[tokio::test]
async fn test_shutdown_closes_pool_and_blocks_restart() {
    let (service, dataset, _) = service(warm_config());
    service.start().await.unwrap();
    let held = service.acquire().await.unwrap();

    service.shutdown().await;

    assert!(matches!(service.acquire().await, Err(DbError::PoolClosed)));
    assert!(matches!(service.start().await, Err(DbError::PoolClosed)));
    assert!(matches!(
        service
            .load_user_progress(&dataset.user_ids(), &ProgressOptions::new())
            .await,
        Err(DbError::PoolClosed)
    ));

    service.release(held);
    let metrics = service.get_metrics().pool;
    assert!(metrics.closed);
    assert_eq!(metrics.total, 0);

    let health = service.health_check().await;
    assert!(!health.healthy);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_job_drops_expired_entries() {
    let mut config = test_service_config(4);
    config.cache.ttl = Duration::from_secs(10);
    config.cache.sweep_interval = Duration::from_secs(5);
    let (service, dataset, _) = service(config);
    service.start().await.unwrap();

    service
        .load_user_progress(&dataset.user_ids(), &ProgressOptions::new())
        .await
        .unwrap();
    assert_eq!(service.cache_stats().entry_count, 1);

    tokio::time::sleep(Duration::from_secs(16)).await;
    let stats = service.cache_stats();
    assert_eq!(stats.entry_count, 0);
    assert_eq!(stats.expirations, 1);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_job_replaces_broken_idle_connections() {
    let mut config = warm_config();
    config.maintenance_interval = Duration::from_secs(10);
    let (service, _, backend) = service(config);
    service.start().await.unwrap();
    assert_eq!(backend.connects(), 2);

    backend.kill_connections();
    tokio::time::sleep(Duration::from_secs(11)).await;

    assert_eq!(backend.connects(), 4);
    let metrics = service.get_metrics().pool;
    assert_eq!(metrics.idle, 2);
    assert_eq!(metrics.destroyed, 2);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_scaling_job_raises_ceiling_of_a_saturated_pool() {
    let mut config = test_service_config(4);
    config.pool = config.pool.with_bounds(1, 4);
    config.scaling = ScalingConfig {
        enabled: true,
        min_connections: 1,
        max_connections: 10,
        scale_up_increment: 2,
        evaluation_interval: Duration::from_secs(30),
        min_scale_interval: Duration::from_secs(60),
        ..ScalingConfig::default()
    };
    let (service, _, _) = service(config);
    service.start().await.unwrap();

    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(service.acquire().await.unwrap());
    }
    tokio::time::sleep(Duration::from_secs(31)).await;

    assert_eq!(service.pool().max_connections(), 6);
    let scaling = service.get_metrics().scaling.unwrap();
    assert_eq!(scaling.current_max, 6);
    assert_eq!(scaling.scale_ups, 1);

    drop(held);
    service.shutdown().await;
}
