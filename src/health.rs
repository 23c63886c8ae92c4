//! Database health probing.
//!
//! [`probe`] is built for liveness/readiness endpoints: it borrows a
//! connection directly from the pool (no long-lived session), issues a
//! minimal round trip, and reports instead of throwing, so callers can
//! serialize the report as-is without special-casing failures.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::StoreResult;
use crate::pool::{PoolManager, PoolStatus};

/// Outcome of one health probe. Computed fresh per call, never cached.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub latency_ms: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Probe database connectivity through the pool.
///
/// Never returns an error: failures (pool down, timeout, broken connection)
/// produce `healthy: false` with the failure text in `error`. Latency covers
/// the full acquire-query-release round trip.
pub async fn probe(manager: &PoolManager) -> HealthReport {
    let started = Instant::now();

    let result = async {
        let mut conn = manager.acquire().await?;
        sqlx::query("SELECT 1")
            .execute(&mut *conn)
            .await
            .map_err(crate::error::StoreError::from)?;
        Ok::<(), crate::error::StoreError>(())
    }
    .await;

    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    let timestamp = Utc::now();

    match result {
        Ok(()) => {
            debug!(latency_ms, "Health probe passed");
            HealthReport {
                healthy: true,
                latency_ms,
                timestamp,
                error: None,
            }
        }
        Err(err) => {
            warn!(latency_ms, error = %err, "Health probe failed");
            HealthReport {
                healthy: false,
                latency_ms,
                timestamp,
                error: Some(err.to_string()),
            }
        }
    }
}

/// Server details plus pool occupancy, for diagnostics endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseInfo {
    pub server_version: String,
    pub pool: PoolStatus,
}

/// Fetch the server version and current pool occupancy.
pub async fn database_info(manager: &PoolManager) -> StoreResult<DatabaseInfo> {
    let mut conn = manager.acquire().await?;
    let server_version: String = sqlx::query_scalar("SELECT sqlite_version()")
        .fetch_one(&mut *conn)
        .await?;
    drop(conn);

    let pool = manager.status().await?;
    Ok(DatabaseInfo {
        server_version,
        pool,
    })
}
