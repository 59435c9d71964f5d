//! Per-scope rate limiting
//!
//! A fixed tumbling-window hit counter keyed on `(scope, client)`, stored in
//! the database so parallel workers share one count. Increments use the
//! database's atomic upsert so no hit is lost under contention.

use std::time::Duration;

use chrono::Utc;

use crate::error::{Result, UdbError};
use crate::store::DbPool;

/// Default threshold within one window.
pub const DEFAULT_LIMIT: u32 = 20;
/// Default tumbling window width.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3600);

/// Shared hit counter. A limit of 0 disables rate limiting entirely.
#[derive(Clone)]
pub struct RateLimiter {
    pool: DbPool,
    limit: u32,
    window_secs: i64,
}

impl RateLimiter {
    pub fn new(pool: DbPool, limit: u32, window: Duration) -> Self {
        Self {
            pool,
            limit,
            window_secs: window.as_secs().max(1) as i64,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    fn window_start(&self) -> i64 {
        let now = Utc::now().timestamp();
        now - now.rem_euclid(self.window_secs)
    }

    fn conn(&self) -> Result<crate::store::PooledConnection> {
        self.pool
            .get()
            .map_err(|e| UdbError::Pool(format!("Failed to get connection: {}", e)))
    }

    /// Fail with `RateLimited` when the client already reached the threshold
    /// in the current window. Run before credential checks: a blocked client
    /// stays blocked even with valid credentials.
    pub fn check(&self, scope: &str, client: &str) -> Result<()> {
        if self.limit == 0 {
            return Ok(());
        }
        if self.hits(scope, client)? >= self.limit {
            Err(UdbError::RateLimited)
        } else {
            Ok(())
        }
    }

    /// Count one miss and return the hit total for the current window.
    pub fn hit(&self, scope: &str, client: &str) -> Result<u32> {
        if self.limit == 0 {
            return Ok(0);
        }
        let conn = self.conn()?;
        let window_start = self.window_start();
        // A stale row from an earlier window restarts at 1.
        conn.execute(
            "INSERT INTO ratelimit (scope, client, window_start, hits)
             VALUES (?1, ?2, ?3, 1)
             ON CONFLICT (scope, client) DO UPDATE SET
                 hits = CASE WHEN window_start = excluded.window_start THEN hits + 1 ELSE 1 END,
                 window_start = excluded.window_start",
            rusqlite::params![scope, client, window_start],
        )?;
        let hits: i64 = conn.query_row(
            "SELECT hits FROM ratelimit WHERE scope = ?1 AND client = ?2",
            rusqlite::params![scope, client],
            |row| row.get(0),
        )?;
        Ok(hits as u32)
    }

    /// Current hit count for the live window only.
    pub fn hits(&self, scope: &str, client: &str) -> Result<u32> {
        let conn = self.conn()?;
        let window_start = self.window_start();
        let hits: Option<i64> = conn
            .query_row(
                "SELECT hits FROM ratelimit
                 WHERE scope = ?1 AND client = ?2 AND window_start = ?3",
                rusqlite::params![scope, client, window_start],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(hits.unwrap_or(0) as u32)
    }

    /// Forget a client's counter (admin action or tests).
    pub fn reset(&self, scope: &str, client: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM ratelimit WHERE scope = ?1 AND client = ?2",
            rusqlite::params![scope, client],
        )?;
        Ok(())
    }
}
