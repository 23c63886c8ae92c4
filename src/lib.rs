//! Async data-access layer for SQLite built on sqlx.
//!
//! The crate is organized around four collaborators:
//!
//! - [`PoolManager`] owns the connection pool and its lifecycle.
//! - [`Session`] binds one checked-out connection to a unit of work.
//! - Transaction scopes ([`TxScope`], [`with_scope`]) nest via savepoints,
//!   so an inner failure can roll back without discarding outer work.
//! - [`Repository`] provides typed CRUD over any [`Record`] type.
//!
//! A health probe, declared-schema metadata and a SQL migration runner round
//! out the operational surface.
//!
//! ```ignore
//! let manager = PoolManager::connect(DatabaseConfig::new("sqlite://app.db")).await?;
//! let users = Repository::<User>::new();
//!
//! let user = manager
//!     .with_session(|s| {
//!         Box::pin(async move {
//!             users.create(s, fields! {"name" => "ada"}).await
//!         })
//!     })
//!     .await?;
//! ```

pub mod config;
pub mod error;
pub mod health;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod schema;
pub mod session;
pub mod transaction;

pub use config::DatabaseConfig;
pub use error::{StoreError, StoreResult};
pub use health::{DatabaseInfo, HealthReport, database_info, probe};
pub use migrations::{MigrationRecord, MigrationRunner};
pub use pool::{PoolManager, PoolStatus};
pub use repository::{Fields, Predicate, Record, Repository, SoftDeletable};
pub use schema::{ColumnDef, ColumnType, SchemaRegistry, TableDef};
pub use session::{Session, SessionState, SharedSession};
pub use transaction::{TxScope, with_scope};
