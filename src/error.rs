//! Error types for the data-access layer.
//!
//! All errors are defined with `thiserror` and classified along two axes:
//! whether the caller can recover (retry, map to a 4xx response) and whether
//! the error indicates a bug in the calling code. Driver errors never escape
//! raw: they pass through [`StoreError::from_driver`], which attaches the
//! operation name, entity type and attempted values, logs once, and
//! re-signals.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Connection parameters are missing or malformed. Fatal at startup.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// `initialize` was called on a pool that is already initialized.
    #[error("Connection pool is already initialized; call shutdown() before re-initializing")]
    AlreadyInitialized,

    /// No connection became available within the configured pool timeout.
    #[error("Timed out acquiring a connection after {timeout:?}")]
    PoolTimeout { timeout: Duration },

    /// The pool was shut down (or never initialized).
    #[error("Connection pool is unavailable: {message}")]
    PoolClosed { message: String },

    /// An operation was attempted on a session after `close()`.
    #[error("Session {session_id} is closed")]
    SessionClosed { session_id: String },

    /// A session was used from two operations at once.
    #[error("Session {session_id} is already in use by another operation")]
    SessionInUse { session_id: String },

    /// Transaction scopes must close in LIFO order.
    #[error(
        "Transaction scope closed out of order: scope at depth {requested} is not the innermost open scope (depth {innermost})"
    )]
    ScopeOrderViolation { requested: usize, innermost: usize },

    /// Lookup by `get_or_fail`/`get_by_or_fail` found nothing.
    #[error("{entity} not found: {key}")]
    NotFound { entity: String, key: String },

    /// Uniqueness / foreign-key / check constraint violation.
    #[error("Integrity violation during {operation} on {entity}: {message}")]
    IntegrityViolation {
        operation: String,
        entity: String,
        message: String,
    },

    /// Transient connectivity failure; the caller may retry with backoff.
    #[error("Connection failure: {message}")]
    ConnectionFailure { message: String },

    /// Catch-all store error carrying full diagnostic context.
    #[error("Store error during {operation} on {entity}: {message}")]
    Store {
        operation: String,
        entity: String,
        values: Option<serde_json::Value>,
        message: String,
    },
}

impl StoreError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a pool-closed error.
    pub fn pool_closed(message: impl Into<String>) -> Self {
        Self::PoolClosed {
            message: message.into(),
        }
    }

    /// Create a session-closed error.
    pub fn session_closed(session_id: impl Into<String>) -> Self {
        Self::SessionClosed {
            session_id: session_id.into(),
        }
    }

    /// Create a session-in-use error.
    pub fn session_in_use(session_id: impl Into<String>) -> Self {
        Self::SessionInUse {
            session_id: session_id.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(entity: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            key: key.into(),
        }
    }

    /// Create a connection-failure error.
    pub fn connection_failure(message: impl Into<String>) -> Self {
        Self::ConnectionFailure {
            message: message.into(),
        }
    }

    /// Create a catch-all store error.
    pub fn store(
        operation: impl Into<String>,
        entity: impl Into<String>,
        values: Option<serde_json::Value>,
        message: impl Into<String>,
    ) -> Self {
        Self::Store {
            operation: operation.into(),
            entity: entity.into(),
            values,
            message: message.into(),
        }
    }

    /// Whether the caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolTimeout { .. } | Self::ConnectionFailure { .. }
        )
    }

    /// Whether this error indicates a bug in the calling code rather than a
    /// runtime condition. These must never be silently swallowed.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::SessionInUse { .. }
                | Self::SessionClosed { .. }
                | Self::ScopeOrderViolation { .. }
                | Self::AlreadyInitialized
        )
    }

    /// Convert a driver error raised during a repository or transaction
    /// operation, attaching operation/entity context.
    ///
    /// This is the single logging point for driver failures: every error is
    /// logged with its context exactly once here, then re-signaled to the
    /// caller in classified form.
    pub fn from_driver(
        operation: &str,
        entity: &str,
        values: Option<serde_json::Value>,
        err: sqlx::Error,
    ) -> Self {
        tracing::error!(
            operation = %operation,
            entity = %entity,
            values = ?values,
            error = %err,
            "Store operation failed"
        );

        match err {
            sqlx::Error::Database(db_err) => {
                use sqlx::error::ErrorKind;
                match db_err.kind() {
                    ErrorKind::UniqueViolation
                    | ErrorKind::ForeignKeyViolation
                    | ErrorKind::NotNullViolation
                    | ErrorKind::CheckViolation => Self::IntegrityViolation {
                        operation: operation.to_string(),
                        entity: entity.to_string(),
                        message: db_err.message().to_string(),
                    },
                    _ => Self::store(operation, entity, values, db_err.message()),
                }
            }
            sqlx::Error::PoolTimedOut => Self::PoolTimeout {
                timeout: Duration::ZERO,
            },
            sqlx::Error::PoolClosed => Self::pool_closed("pool closed during operation"),
            sqlx::Error::Io(io_err) => Self::connection_failure(format!("I/O error: {io_err}")),
            sqlx::Error::Tls(tls_err) => Self::connection_failure(format!("TLS error: {tls_err}")),
            sqlx::Error::Protocol(msg) => {
                Self::connection_failure(format!("protocol error: {msg}"))
            }
            sqlx::Error::WorkerCrashed => Self::connection_failure("database worker crashed"),
            other => Self::store(operation, entity, values, other.to_string()),
        }
    }
}

/// Context-free conversion for pool-level paths where no operation is in
/// flight. Repository and transaction code uses [`StoreError::from_driver`]
/// instead.
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => Self::configuration(msg.to_string()),
            sqlx::Error::PoolTimedOut => Self::PoolTimeout {
                timeout: Duration::ZERO,
            },
            sqlx::Error::PoolClosed => Self::pool_closed("pool is closed"),
            sqlx::Error::Io(io_err) => Self::connection_failure(format!("I/O error: {io_err}")),
            sqlx::Error::Tls(tls_err) => Self::connection_failure(format!("TLS error: {tls_err}")),
            sqlx::Error::Protocol(msg) => {
                Self::connection_failure(format!("protocol error: {msg}"))
            }
            other => Self::store("connect", "-", None, other.to_string()),
        }
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
