#![allow(dead_code)]

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use relstore::{
    ColumnDef, ColumnType, DatabaseConfig, PoolManager, Record, SoftDeletable, TableDef,
};

/// Row type used across the integration tests.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Record for User {
    const TABLE: &'static str = "users";
    const COLUMNS: &'static [ColumnDef] = &[
        ColumnDef::new("id", ColumnType::Integer).primary_key(),
        ColumnDef::new("name", ColumnType::Text),
        ColumnDef::new("email", ColumnType::Text).nullable().unique(),
        ColumnDef::new("active", ColumnType::Boolean),
        ColumnDef::new("created_at", ColumnType::Timestamp),
        ColumnDef::new("updated_at", ColumnType::Timestamp),
        ColumnDef::new("deleted_at", ColumnType::Timestamp).nullable(),
    ];

    fn id(&self) -> i64 {
        self.id
    }
}

impl SoftDeletable for User {
    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }
}

/// An initialized pool backed by a temp-file database with the `users`
/// table created. The temp directory lives as long as this value.
pub struct TestDb {
    pub manager: PoolManager,
    pub dir: TempDir,
}

impl TestDb {
    pub fn url(&self) -> String {
        format!("sqlite://{}", self.dir.path().join("test.db").display())
    }
}

pub async fn setup() -> TestDb {
    setup_with(|config| config).await
}

static TRACING: std::sync::Once = std::sync::Once::new();

/// Opt into log output with e.g. `RUST_LOG=relstore=debug cargo test`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// In-memory databases give every pooled connection its own database, so
/// the tests always go through a temp file.
pub async fn setup_with(tweak: impl FnOnce(DatabaseConfig) -> DatabaseConfig) -> TestDb {
    init_tracing();
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("test.db");
    let config = tweak(DatabaseConfig::new(format!("sqlite://{}", path.display())));
    let manager = PoolManager::connect(config).await.expect("initialize pool");

    let table = TableDef {
        name: User::TABLE,
        columns: User::COLUMNS,
    };
    let mut conn = manager.acquire().await.expect("acquire connection");
    sqlx::raw_sql(&table.create_sql())
        .execute(&mut *conn)
        .await
        .expect("create users table");

    TestDb { manager, dir }
}
