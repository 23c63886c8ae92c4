//! Sessions: one checked-out connection per unit of work.
//!
//! A [`Session`] owns exactly one pooled connection for its lifetime and is
//! the object repositories and transaction scopes operate on. Exclusive
//! ownership is the rule: every operation takes `&mut Session`, so the
//! borrow checker rules out concurrent use of one session. For code that has
//! to hand a session across task boundaries, [`SharedSession`] wraps it in a
//! mutex that fails fast with `SessionInUse` instead of queueing.

use std::sync::Arc;

use sqlx::Sqlite;
use sqlx::SqliteConnection;
use sqlx::pool::PoolConnection;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection held, no transaction open.
    Idle,
    /// At least one transaction scope is open.
    ActiveTransaction,
    /// Connection returned to the pool; the session is finished.
    Closed,
}

/// A unit of work bound to one pooled connection.
///
/// Created by [`PoolManager::open_session`](crate::pool::PoolManager::open_session)
/// or the scoped [`PoolManager::with_session`](crate::pool::PoolManager::with_session).
/// Closing never commits: uncommitted work is rolled back and the connection
/// goes back to the pool.
pub struct Session {
    id: String,
    conn: Option<PoolConnection<Sqlite>>,
    /// Tokens of open transaction scopes, innermost last.
    pub(crate) scopes: Vec<u64>,
    pub(crate) next_token: u64,
    echo: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("depth", &self.scopes.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(conn: PoolConnection<Sqlite>, echo: bool) -> Self {
        let id = format!("sess_{}", Uuid::new_v4().simple());
        debug!(session_id = %id, "Session opened");
        Self {
            id,
            conn: Some(conn),
            scopes: Vec::new(),
            next_token: 0,
            echo,
        }
    }

    /// Unique session identifier, used in logs and error messages.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        if self.conn.is_none() {
            SessionState::Closed
        } else if self.scopes.is_empty() {
            SessionState::Idle
        } else {
            SessionState::ActiveTransaction
        }
    }

    /// Whether a transaction scope is currently open.
    pub fn in_transaction(&self) -> bool {
        !self.scopes.is_empty()
    }

    /// Current nesting depth: 0 when idle, 1 for a real transaction,
    /// 2+ when savepoints are stacked on top.
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Borrow the underlying connection, failing if the session is closed.
    pub(crate) fn conn(&mut self) -> StoreResult<&mut SqliteConnection> {
        let id = self.id.clone();
        match self.conn.as_mut() {
            Some(conn) => Ok(&mut *conn),
            None => Err(StoreError::session_closed(id)),
        }
    }

    /// Log a statement, at `info` when the config's `echo` flag is set.
    pub(crate) fn trace_sql(&self, sql: &str) {
        if self.echo {
            info!(session_id = %self.id, sql = %sql, "SQL");
        } else {
            debug!(session_id = %self.id, sql = %sql, "SQL");
        }
    }

    /// Close the session and return its connection to the pool.
    ///
    /// Closing is a pure resource-release step: nothing is committed. Any
    /// open transaction is rolled back first so the connection goes back
    /// clean. Idempotent; closing twice is a no-op.
    pub async fn close(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };

        if !self.scopes.is_empty() {
            warn!(
                session_id = %self.id,
                depth = self.scopes.len(),
                "Session closed with an open transaction; rolling back"
            );
            self.scopes.clear();
            if let Err(err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                // The connection state is unknown; discard it instead of
                // returning it to the pool.
                warn!(session_id = %self.id, error = %err, "Rollback on close failed, discarding connection");
                drop(conn.detach());
                return;
            }
        }

        debug!(session_id = %self.id, "Session closed");
        drop(conn);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // A connection dropped mid-transaction (error path, cancellation)
        // must not be reused: detach it from the pool so a fresh connection
        // replaces it.
        if !self.scopes.is_empty() {
            if let Some(conn) = self.conn.take() {
                warn!(
                    session_id = %self.id,
                    depth = self.scopes.len(),
                    "Session dropped mid-transaction; discarding connection"
                );
                drop(conn.detach());
            }
        }
    }
}

/// A session shareable across tasks, guarded against concurrent use.
///
/// Locking does not queue: if another operation currently holds the session,
/// [`SharedSession::acquire`] fails immediately with `SessionInUse`. Sharing
/// a session between concurrent operations is a bug in the caller, and this
/// surfaces it instead of serializing silently.
#[derive(Clone)]
pub struct SharedSession {
    id: String,
    inner: Arc<Mutex<Session>>,
}

impl std::fmt::Debug for SharedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSession").field("id", &self.id).finish()
    }
}

impl SharedSession {
    pub fn new(session: Session) -> Self {
        Self {
            id: session.id().to_string(),
            inner: Arc::new(Mutex::new(session)),
        }
    }

    /// Take exclusive hold of the session, failing fast when it is already
    /// held by another operation.
    pub fn acquire(&self) -> StoreResult<OwnedMutexGuard<Session>> {
        Arc::clone(&self.inner)
            .try_lock_owned()
            .map_err(|_| StoreError::session_in_use(self.id.clone()))
    }

    /// Close the underlying session. Fails with `SessionInUse` if an
    /// operation still holds it.
    pub async fn close(&self) -> StoreResult<()> {
        let mut guard = self.acquire()?;
        guard.close().await;
        Ok(())
    }
}
