//! Connection pool management.
//!
//! [`PoolManager`] is the process-wide pool as an explicit handle: created
//! once at startup, passed to whoever needs it, torn down once at shutdown.
//! Nothing here is a global, so tests can run any number of isolated pools
//! side by side.

use std::str::FromStr;

use serde::Serialize;
use sqlx::Sqlite;
use sqlx::SqlitePool;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::{StoreError, StoreResult};
use crate::session::Session;

/// Point-in-time pool occupancy, for introspection endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    /// Connections currently open (idle + checked out).
    pub size: u32,
    /// Connections sitting idle in the pool.
    pub idle: u32,
    /// Connections currently checked out.
    pub in_use: u32,
    /// Hard ceiling: `pool_size + max_overflow`.
    pub max: u32,
}

enum PoolState {
    Uninitialized,
    Ready {
        pool: SqlitePool,
        config: DatabaseConfig,
    },
    Closed,
}

/// Owner of the single pool of live database connections.
///
/// Lifecycle: [`new`](Self::new) → [`initialize`](Self::initialize) →
/// `acquire`/`open_session` → [`shutdown`](Self::shutdown). Initializing an
/// already-initialized manager fails with `AlreadyInitialized`; acquiring
/// from an uninitialized or shut-down manager fails with `PoolClosed`.
pub struct PoolManager {
    state: RwLock<PoolState>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager").finish_non_exhaustive()
    }
}

impl PoolManager {
    /// Create an uninitialized manager.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PoolState::Uninitialized),
        }
    }

    /// Convenience: create and initialize in one step.
    pub async fn connect(config: DatabaseConfig) -> StoreResult<Self> {
        let manager = Self::new();
        manager.initialize(config).await?;
        Ok(manager)
    }

    /// Build the connection pool from a validated config snapshot.
    ///
    /// The config maps onto the pool as: `pool_size` warm connections,
    /// `pool_size + max_overflow` total ceiling, `pool_timeout` as acquire
    /// timeout, `pool_recycle` as maximum connection lifetime, and
    /// `pre_ping` validating connections before handout.
    pub async fn initialize(&self, config: DatabaseConfig) -> StoreResult<()> {
        config.validate()?;

        {
            let state = self.state.read().await;
            if matches!(*state, PoolState::Ready { .. }) {
                return Err(StoreError::AlreadyInitialized);
            }
        }

        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| {
                StoreError::configuration(format!("invalid database URL '{}': {e}", config.url))
            })?
            .create_if_missing(true);

        let mut pool_options = SqlitePoolOptions::new()
            .min_connections(config.pool_size)
            .max_connections(config.max_connections())
            .acquire_timeout(config.pool_timeout)
            .test_before_acquire(config.pre_ping);
        if let Some(recycle) = config.pool_recycle {
            pool_options = pool_options.max_lifetime(recycle);
        }

        info!(
            pool_size = config.pool_size,
            max_overflow = config.max_overflow,
            pool_timeout_ms = config.pool_timeout.as_millis() as u64,
            pre_ping = config.pre_ping,
            "Initializing connection pool"
        );

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StoreError::connection_failure(format!("failed to connect: {e}")))?;

        // Re-check after the async connect so two racing initializers cannot
        // both install a pool.
        let stale = {
            let mut state = self.state.write().await;
            if matches!(*state, PoolState::Ready { .. }) {
                Some(pool)
            } else {
                *state = PoolState::Ready { pool, config };
                None
            }
        };

        if let Some(pool) = stale {
            pool.close().await;
            return Err(StoreError::AlreadyInitialized);
        }

        info!("Connection pool ready");
        Ok(())
    }

    async fn ready(&self) -> StoreResult<(SqlitePool, DatabaseConfig)> {
        let state = self.state.read().await;
        match &*state {
            PoolState::Ready { pool, config } => Ok((pool.clone(), config.clone())),
            PoolState::Uninitialized => Err(StoreError::pool_closed(
                "pool is not initialized; call initialize() first",
            )),
            PoolState::Closed => Err(StoreError::pool_closed("pool has been shut down")),
        }
    }

    /// Check out one connection, waiting up to the configured `pool_timeout`.
    ///
    /// Waiting is a suspension point: if the calling task is cancelled while
    /// queued, its slot goes to the next waiter. Returns `PoolTimeout` when
    /// the wait elapses and `PoolClosed` after shutdown.
    pub async fn acquire(&self) -> StoreResult<PoolConnection<Sqlite>> {
        let (pool, config) = self.ready().await?;
        pool.acquire().await.map_err(|e| match e {
            sqlx::Error::PoolTimedOut => StoreError::PoolTimeout {
                timeout: config.pool_timeout,
            },
            sqlx::Error::PoolClosed => StoreError::pool_closed("pool has been shut down"),
            other => other.into(),
        })
    }

    /// Open a [`Session`] bound to one checked-out connection.
    pub async fn open_session(&self) -> StoreResult<Session> {
        let (_, config) = self.ready().await?;
        let conn = self.acquire().await?;
        Ok(Session::new(conn, config.echo))
    }

    /// Scoped session acquisition: opens a session, runs `body`, and closes
    /// the session on every exit path, including failure.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let user = manager
    ///     .with_session(|s| Box::pin(async move { repo.get_or_fail(s, 1).await }))
    ///     .await?;
    /// ```
    pub async fn with_session<T>(
        &self,
        body: impl for<'a> FnOnce(
            &'a mut Session,
        ) -> futures_util::future::BoxFuture<'a, StoreResult<T>>,
    ) -> StoreResult<T> {
        let mut session = self.open_session().await?;
        let result = body(&mut session).await;
        session.close().await;
        result
    }

    /// Current pool occupancy.
    pub async fn status(&self) -> StoreResult<PoolStatus> {
        let (pool, config) = self.ready().await?;
        let size = pool.size();
        let idle = pool.num_idle() as u32;
        Ok(PoolStatus {
            size,
            idle,
            in_use: size.saturating_sub(idle),
            max: config.max_connections(),
        })
    }

    /// Drain in-flight checkouts and close every connection.
    ///
    /// Subsequent `acquire`/`open_session` calls fail with `PoolClosed`.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let pool = {
            let mut state = self.state.write().await;
            match std::mem::replace(&mut *state, PoolState::Closed) {
                PoolState::Ready { pool, .. } => Some(pool),
                _ => None,
            }
        };

        if let Some(pool) = pool {
            info!("Shutting down connection pool");
            pool.close().await;
            info!("Connection pool closed");
        } else {
            debug!("Shutdown called on a pool that was never initialized");
        }
    }
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new()
    }
}
