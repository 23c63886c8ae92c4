mod common;

use std::time::Duration;

use relstore::{DatabaseConfig, PoolManager, StoreError};

#[tokio::test]
async fn test_acquire_blocks_then_times_out_at_capacity() {
    let db = common::setup_with(|mut config| {
        config.pool_size = 2;
        config.max_overflow = 0;
        config.pool_timeout = Duration::from_millis(100);
        config
    })
    .await;

    let _c1 = db.manager.acquire().await.expect("first connection");
    let _c2 = db.manager.acquire().await.expect("second connection");

    let err = db.manager.acquire().await.unwrap_err();
    match err {
        StoreError::PoolTimeout { timeout } => {
            assert_eq!(timeout, Duration::from_millis(100));
        }
        other => panic!("expected PoolTimeout, got {other:?}"),
    }
    assert!(err_is_retryable(&db).await);
}

async fn err_is_retryable(db: &common::TestDb) -> bool {
    db.manager.acquire().await.unwrap_err().is_retryable()
}

#[tokio::test]
async fn test_waiter_gets_connection_when_one_frees_up() {
    let db = common::setup_with(|mut config| {
        config.pool_size = 1;
        config.max_overflow = 0;
        config.pool_timeout = Duration::from_secs(5);
        config
    })
    .await;

    let held = db.manager.acquire().await.expect("hold the only connection");
    drop(held);
    db.manager
        .acquire()
        .await
        .expect("freed connection should satisfy the next acquire");
}

#[tokio::test]
async fn test_initialize_twice_fails() {
    let db = common::setup().await;
    let err = db
        .manager
        .initialize(DatabaseConfig::new(db.url()))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::AlreadyInitialized));
}

#[tokio::test]
async fn test_invalid_config_rejected_before_connecting() {
    let manager = PoolManager::new();
    let err = manager
        .initialize(DatabaseConfig::new("postgres://localhost/app"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Configuration { .. }));
}

#[tokio::test]
async fn test_status_tracks_checkouts() {
    let db = common::setup_with(|mut config| {
        config.pool_size = 2;
        config.max_overflow = 1;
        config
    })
    .await;

    let status = db.manager.status().await.expect("status");
    assert_eq!(status.max, 3);

    let _held = db.manager.acquire().await.expect("acquire");
    let status = db.manager.status().await.expect("status");
    assert!(status.in_use >= 1);
    assert_eq!(status.in_use + status.idle, status.size);
}

#[tokio::test]
async fn test_shutdown_closes_the_pool() {
    let db = common::setup().await;
    db.manager.shutdown().await;

    let err = db.manager.acquire().await.unwrap_err();
    assert!(matches!(err, StoreError::PoolClosed { .. }));

    // Idempotent.
    db.manager.shutdown().await;
}

#[tokio::test]
async fn test_with_session_returns_body_result() {
    let db = common::setup().await;

    let two: i64 = db
        .manager
        .with_session(|session| {
            Box::pin(async move {
                let _ = session.id();
                Ok(2)
            })
        })
        .await
        .expect("with_session");
    assert_eq!(two, 2);
}

#[tokio::test]
async fn test_with_session_closes_session_on_error() {
    let db = common::setup_with(|mut config| {
        config.pool_size = 1;
        config.max_overflow = 0;
        config.pool_timeout = Duration::from_millis(200);
        config
    })
    .await;

    let result: Result<(), _> = db
        .manager
        .with_session(|_session| {
            Box::pin(async move { Err(relstore::StoreError::configuration("boom")) })
        })
        .await;
    assert!(result.is_err());

    // The single connection must be back in the pool.
    db.manager
        .acquire()
        .await
        .expect("connection released after failed body");
}
