//! Resolved connection configuration.
//!
//! The configuration collaborator (layered settings, secret resolution, env
//! files) lives outside this crate. What arrives here is an already-resolved
//! snapshot of connection parameters; the only job of this module is to hold
//! it and to fail fast on values the pool cannot work with.

use std::time::Duration;

use url::Url;

use crate::error::{StoreError, StoreResult};

/// Steady-state pool capacity.
pub const DEFAULT_POOL_SIZE: u32 = 5;
/// Burst capacity beyond `pool_size`.
pub const DEFAULT_MAX_OVERFLOW: u32 = 10;
/// Maximum wait for a pooled connection.
pub const DEFAULT_POOL_TIMEOUT_SECS: u64 = 30;
/// Maximum connection age before forced replacement.
pub const DEFAULT_POOL_RECYCLE_SECS: u64 = 3600;

/// Immutable snapshot of database connection parameters.
///
/// Consumed by [`PoolManager::initialize`](crate::pool::PoolManager::initialize).
/// The pool may hand out at most `pool_size + max_overflow` connections at
/// once; checkouts beyond that block up to `pool_timeout` and then fail.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database URL, e.g. `sqlite:data/app.db` or `sqlite::memory:`.
    pub url: String,
    /// Number of connections kept warm.
    pub pool_size: u32,
    /// Additional connections allowed under burst load.
    pub max_overflow: u32,
    /// Maximum wait when acquiring a connection.
    pub pool_timeout: Duration,
    /// Connections older than this are discarded instead of reused.
    /// `None` disables recycling.
    pub pool_recycle: Option<Duration>,
    /// Validate connections with a round trip before handing them out.
    pub pre_ping: bool,
    /// Log every SQL statement at `info` instead of `debug`.
    pub echo: bool,
}

impl DatabaseConfig {
    /// Create a configuration with default pool settings.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: DEFAULT_POOL_SIZE,
            max_overflow: DEFAULT_MAX_OVERFLOW,
            pool_timeout: Duration::from_secs(DEFAULT_POOL_TIMEOUT_SECS),
            pool_recycle: Some(Duration::from_secs(DEFAULT_POOL_RECYCLE_SECS)),
            pre_ping: true,
            echo: false,
        }
    }

    /// Total number of connections the pool may hand out concurrently.
    pub fn max_connections(&self) -> u32 {
        self.pool_size + self.max_overflow
    }

    /// Validate the snapshot, failing fast with a descriptive
    /// [`StoreError::Configuration`] on bad values.
    pub fn validate(&self) -> StoreResult<()> {
        if self.url.is_empty() {
            return Err(StoreError::configuration("database URL is required"));
        }

        let parsed = Url::parse(&self.url).map_err(|e| {
            StoreError::configuration(format!("malformed database URL: {e}"))
        })?;

        if parsed.scheme() != "sqlite" {
            return Err(StoreError::configuration(format!(
                "unsupported database scheme '{}': expected 'sqlite'",
                parsed.scheme()
            )));
        }

        if self.pool_size == 0 {
            return Err(StoreError::configuration(
                "pool_size must be greater than 0",
            ));
        }

        if self.pool_timeout.is_zero() {
            return Err(StoreError::configuration(
                "pool_timeout must be greater than 0",
            ));
        }

        Ok(())
    }
}
