//! Nested transaction scopes over a savepoint stack.
//!
//! The outermost scope is a real transaction (`BEGIN`); every scope opened
//! while one is already active becomes a savepoint. The stack is explicit
//! and depth-tracked on the [`Session`], so closing scopes out of LIFO order
//! is detected deterministically and rejected as `ScopeOrderViolation`
//! instead of corrupting transaction state.
//!
//! State machine per session:
//!
//! ```text
//! NONE --begin--> TX_OPEN(0) --begin--> TX_OPEN(1) --begin--> ...
//!                    |  commit/rollback at depth 0 -> NONE
//!                    |  commit at depth n>0: RELEASE SAVEPOINT (merge into parent)
//!                    |  rollback at depth n>0: ROLLBACK TO SAVEPOINT (parent survives)
//! ```

use futures_util::future::BoxFuture;
use tracing::{debug, error};

use crate::error::{StoreError, StoreResult};
use crate::session::Session;

/// Handle to one open transaction scope.
///
/// Returned by [`Session::begin`] and consumed by [`Session::commit`] /
/// [`Session::rollback`]. Only the innermost open scope can be closed.
#[must_use = "an open transaction scope must be committed or rolled back"]
#[derive(Debug)]
pub struct TxScope {
    pub(crate) token: u64,
    depth: usize,
}

impl TxScope {
    /// Nesting depth of this scope: 0 is the real transaction, higher values
    /// are savepoints.
    pub fn depth(&self) -> usize {
        self.depth
    }
}

fn savepoint_name(depth: usize) -> String {
    format!("sp_{depth}")
}

impl Session {
    /// Open a transaction scope.
    ///
    /// With no transaction active this starts a real transaction; while one
    /// is open it pushes a savepoint, which is how nested scopes are
    /// realized. Scopes must be closed innermost-first.
    pub async fn begin(&mut self) -> StoreResult<TxScope> {
        let depth = self.scopes.len();
        let sql = if depth == 0 {
            "BEGIN".to_string()
        } else {
            format!("SAVEPOINT {}", savepoint_name(depth))
        };

        self.trace_sql(&sql);
        let conn = self.conn()?;
        sqlx::query(&sql)
            .execute(conn)
            .await
            .map_err(|e| StoreError::from_driver("begin", "transaction", None, e))?;

        let token = self.next_token;
        self.next_token += 1;
        self.scopes.push(token);

        debug!(session_id = %self.id(), depth, "Transaction scope opened");
        Ok(TxScope { token, depth })
    }

    /// Commit a scope. At depth 0 this commits the real transaction; at
    /// depth > 0 it releases the savepoint, merging its work into the parent
    /// scope without touching the outer transaction.
    pub async fn commit(&mut self, scope: TxScope) -> StoreResult<()> {
        self.check_innermost(&scope)?;

        let sql = if scope.depth == 0 {
            "COMMIT".to_string()
        } else {
            format!("RELEASE SAVEPOINT {}", savepoint_name(scope.depth))
        };

        self.trace_sql(&sql);
        let conn = self.conn()?;
        sqlx::query(&sql)
            .execute(conn)
            .await
            .map_err(|e| StoreError::from_driver("commit", "transaction", None, e))?;

        self.scopes.pop();
        debug!(session_id = %self.id(), depth = scope.depth, "Transaction scope committed");
        Ok(())
    }

    /// Roll back a scope. At depth 0 this rolls back the real transaction;
    /// at depth > 0 it rolls back to the savepoint only; writes and state
    /// from ancestor scopes survive.
    pub async fn rollback(&mut self, scope: TxScope) -> StoreResult<()> {
        self.check_innermost(&scope)?;

        if scope.depth == 0 {
            self.trace_sql("ROLLBACK");
            let conn = self.conn()?;
            sqlx::query("ROLLBACK")
                .execute(conn)
                .await
                .map_err(|e| StoreError::from_driver("rollback", "transaction", None, e))?;
        } else {
            let name = savepoint_name(scope.depth);
            // ROLLBACK TO leaves the savepoint on the stack; RELEASE pops it.
            for sql in [
                format!("ROLLBACK TO SAVEPOINT {name}"),
                format!("RELEASE SAVEPOINT {name}"),
            ] {
                self.trace_sql(&sql);
                let conn = self.conn()?;
                sqlx::query(&sql)
                    .execute(conn)
                    .await
                    .map_err(|e| StoreError::from_driver("rollback", "transaction", None, e))?;
            }
        }

        self.scopes.pop();
        debug!(session_id = %self.id(), depth = scope.depth, "Transaction scope rolled back");
        Ok(())
    }

    /// Roll back a scope on an error path, keeping the original error.
    ///
    /// A rollback failure here cannot be surfaced without masking the error
    /// that triggered the unwind, so it is logged and swallowed; the dirty
    /// connection is discarded on close instead of being reused.
    pub(crate) async fn abort_scope(&mut self, scope: TxScope) {
        if let Err(err) = self.rollback(scope).await {
            error!(
                session_id = %self.id(),
                error = %err,
                "Rollback failed while unwinding a failed scope"
            );
        }
    }

    fn check_innermost(&self, scope: &TxScope) -> StoreResult<()> {
        match self.scopes.last() {
            Some(&top) if top == scope.token => Ok(()),
            _ => Err(StoreError::ScopeOrderViolation {
                requested: scope.depth,
                innermost: self.scopes.len().saturating_sub(1),
            }),
        }
    }
}

/// Run `body` inside a transaction scope with automatic cleanup.
///
/// Commits when `body` returns `Ok`; on `Err`, rolls back **this scope
/// only** and re-signals the original error. Ancestor scopes stay open and
/// it is the caller's decision whether to continue or fail too. This is the
/// mechanism behind "inner failure, outer survives".
///
/// # Example
///
/// ```ignore
/// let value = with_scope(&mut session, |s| {
///     Box::pin(async move {
///         repo.create(s, fields!{"name" => "a"}).await
///     })
/// })
/// .await?;
/// ```
pub async fn with_scope<T>(
    session: &mut Session,
    body: impl for<'a> FnOnce(&'a mut Session) -> BoxFuture<'a, StoreResult<T>>,
) -> StoreResult<T> {
    let scope = session.begin().await?;
    match body(session).await {
        Ok(value) => {
            session.commit(scope).await?;
            Ok(value)
        }
        Err(err) => {
            session.abort_scope(scope).await;
            Err(err)
        }
    }
}
