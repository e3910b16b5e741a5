#![cfg(feature = "db-tests")]
//! Smoke tests against a live PostgreSQL.
//!
//! Run with `--features db-tests` and the `MEDROTA_DB_*` variables pointing
//! at a database that carries the Medrota schema and views.

use medrota_db::PgService;
use medrota_test_utils::{
    AnalyticsOptions, EntityIdType, ProgressOptions, RotationId, RotationOptions, UserId,
};

#[tokio::test]
async fn test_service_round_trip_against_postgres() {
    let service = PgService::from_env().expect("service config from env");
    service.start().await.expect("warm pool");

    let health = service.health_check().await;
    assert!(health.healthy, "health check failed: {:?}", health.error);

    let conn = service.acquire().await.expect("acquire");
    let row = conn
        .client()
        .query_one("SHOW statement_timeout", &[])
        .await
        .expect("show statement_timeout");
    let timeout: String = row.get(0);
    assert_ne!(timeout, "0");
    service.release(conn);

    let unknown = vec![UserId::now_v7(), UserId::now_v7()];
    let progress = service
        .load_user_progress(&unknown, &ProgressOptions::new().include_all())
        .await
        .expect("load progress");
    assert!(progress.is_empty());

    let analytics = service
        .load_competency_analytics(&unknown, &AnalyticsOptions::new())
        .await
        .expect("load analytics");
    assert!(analytics.is_empty());

    let overviews = service
        .load_rotation_overviews(&[RotationId::now_v7()], &RotationOptions::new().with_time_records())
        .await
        .expect("load rotations");
    assert!(overviews.is_empty());

    service.shutdown().await;
    assert!(service.get_metrics().pool.closed);
}
