mod common;

use std::fs;

use common::User;
use relstore::{MigrationRunner, SchemaRegistry, StoreError};

fn write_migration(dir: &std::path::Path, version: i64, name: &str, up: &str, down: &str) {
    fs::write(dir.join(format!("{version}_{name}.up.sql")), up).expect("write up");
    fs::write(dir.join(format!("{version}_{name}.down.sql")), down).expect("write down");
}

fn seed_two_migrations(dir: &std::path::Path) {
    write_migration(
        dir,
        1,
        "create_widgets",
        "CREATE TABLE widgets (id INTEGER PRIMARY KEY, label TEXT NOT NULL);",
        "DROP TABLE widgets;",
    );
    write_migration(
        dir,
        2,
        "add_gadgets",
        "CREATE TABLE gadgets (id INTEGER PRIMARY KEY);",
        "DROP TABLE gadgets;",
    );
}

async fn table_exists(db: &common::TestDb, name: &str) -> bool {
    let mut conn = db.manager.acquire().await.expect("acquire");
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_one(&mut *conn)
            .await
            .expect("query sqlite_master");
    count > 0
}

#[tokio::test]
async fn test_apply_runs_pending_migrations_in_order() {
    let db = common::setup().await;
    let dir = db.dir.path().join("migrations");
    fs::create_dir_all(&dir).expect("create dir");
    seed_two_migrations(&dir);

    let runner = MigrationRunner::new(&dir);
    let applied = runner.apply(&db.manager, None).await.expect("apply");
    assert_eq!(applied.len(), 2);
    assert_eq!(applied[0].version, 1);
    assert_eq!(applied[1].version, 2);
    assert!(table_exists(&db, "widgets").await);
    assert!(table_exists(&db, "gadgets").await);

    // Re-applying finds nothing pending.
    let applied = runner.apply(&db.manager, None).await.expect("apply");
    assert!(applied.is_empty());

    let history = runner.history(&db.manager).await.expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].description, "create_widgets");
}

#[tokio::test]
async fn test_apply_stops_at_target() {
    let db = common::setup().await;
    let dir = db.dir.path().join("migrations");
    fs::create_dir_all(&dir).expect("create dir");
    seed_two_migrations(&dir);

    let runner = MigrationRunner::new(&dir);
    let applied = runner.apply(&db.manager, Some(1)).await.expect("apply");
    assert_eq!(applied.len(), 1);
    assert!(table_exists(&db, "widgets").await);
    assert!(!table_exists(&db, "gadgets").await);

    // Catching up to head applies the rest.
    let applied = runner.apply(&db.manager, None).await.expect("apply");
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].version, 2);
}

#[tokio::test]
async fn test_apply_rejects_target_below_head() {
    let db = common::setup().await;
    let dir = db.dir.path().join("migrations");
    fs::create_dir_all(&dir).expect("create dir");
    seed_two_migrations(&dir);

    let runner = MigrationRunner::new(&dir);
    runner.apply(&db.manager, None).await.expect("apply");

    let err = runner.apply(&db.manager, Some(1)).await.unwrap_err();
    match err {
        StoreError::Store { ref message, .. } => {
            assert!(message.contains("below the current head"));
        }
        ref other => panic!("expected Store error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_migration_leaves_no_history_row() {
    let db = common::setup().await;
    let dir = db.dir.path().join("migrations");
    fs::create_dir_all(&dir).expect("create dir");
    write_migration(
        &dir,
        1,
        "broken",
        "CREATE TABLE nope (id INTEGER PRIMARY KEY);\nTHIS IS NOT SQL;",
        "DROP TABLE nope;",
    );

    let runner = MigrationRunner::new(&dir);
    assert!(runner.apply(&db.manager, None).await.is_err());

    let history = runner.history(&db.manager).await.expect("history");
    assert!(history.is_empty());
}

#[tokio::test]
async fn test_rollback_reverts_newest_first() {
    let db = common::setup().await;
    let dir = db.dir.path().join("migrations");
    fs::create_dir_all(&dir).expect("create dir");
    seed_two_migrations(&dir);

    let runner = MigrationRunner::new(&dir);
    runner.apply(&db.manager, None).await.expect("apply");

    let reverted = runner.rollback(&db.manager, 1).await.expect("rollback");
    assert_eq!(reverted.len(), 1);
    assert_eq!(reverted[0].version, 2);
    assert!(table_exists(&db, "widgets").await);
    assert!(!table_exists(&db, "gadgets").await);

    let history = runner.history(&db.manager).await.expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].version, 1);
}

#[tokio::test]
async fn test_generate_writes_skeleton_pair() {
    let db = common::setup().await;
    let dir = db.dir.path().join("migrations");

    let runner = MigrationRunner::new(&dir);
    let (up, down) = runner
        .generate("Add users table", false, None)
        .expect("generate");

    assert!(up.file_name().unwrap().to_str().unwrap().ends_with("_add_users_table.up.sql"));
    assert!(
        down.file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .ends_with("_add_users_table.down.sql")
    );
    assert!(fs::read_to_string(&up).expect("read up").contains("Add users table"));
}

#[tokio::test]
async fn test_generate_with_schema_prefills_ddl() {
    let db = common::setup().await;
    let dir = db.dir.path().join("migrations");

    let mut registry = SchemaRegistry::new();
    registry.register::<User>();

    let runner = MigrationRunner::new(&dir);
    let (up, down) = runner
        .generate("initial schema", true, Some(&registry))
        .expect("generate");

    let up_sql = fs::read_to_string(&up).expect("read up");
    assert!(up_sql.contains("CREATE TABLE IF NOT EXISTS users"));
    assert!(up_sql.contains("email TEXT UNIQUE"));

    let down_sql = fs::read_to_string(&down).expect("read down");
    assert!(down_sql.contains("DROP TABLE IF EXISTS users;"));
}
