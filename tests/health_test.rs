mod common;

use relstore::{database_info, probe};

#[tokio::test]
async fn test_probe_reports_healthy() {
    let db = common::setup().await;

    let report = probe(&db.manager).await;
    assert!(report.healthy);
    assert!(report.latency_ms >= 0.0);
    assert!(report.error.is_none());

    let json = serde_json::to_value(&report).expect("serialize");
    assert_eq!(json["healthy"], serde_json::Value::Bool(true));
    // A clean probe serializes without an error key at all.
    assert!(json.get("error").is_none());
}

#[tokio::test]
async fn test_probe_reports_unhealthy_after_shutdown() {
    let db = common::setup().await;
    db.manager.shutdown().await;

    let report = probe(&db.manager).await;
    assert!(!report.healthy);
    let error = report.error.clone().expect("failure text");
    assert!(!error.is_empty());

    let json = serde_json::to_value(&report).expect("serialize");
    assert_eq!(json["healthy"], serde_json::Value::Bool(false));
    assert!(json.get("error").is_some());
}

#[tokio::test]
async fn test_probe_never_panics_on_uninitialized_manager() {
    let manager = relstore::PoolManager::new();
    let report = probe(&manager).await;
    assert!(!report.healthy);
    assert!(report.error.is_some());
}

#[tokio::test]
async fn test_database_info() {
    let db = common::setup_with(|mut config| {
        config.pool_size = 2;
        config.max_overflow = 3;
        config
    })
    .await;

    let info = database_info(&db.manager).await.expect("database_info");
    assert!(!info.server_version.is_empty());
    assert_eq!(info.pool.max, 5);
}
