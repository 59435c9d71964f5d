//! Authenticated session store
//!
//! Opaque UUID session tokens persisted in the database so any worker can
//! resolve them. Logout clears the user binding; the row itself may be
//! reused by a later login with the same token id.

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Result, UdbError};
use crate::store::DbPool;

/// Short-lived session TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
/// TTL of sessions opened with `persistent = true`.
pub const DEFAULT_PERSISTENT_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

/// One authenticated session row.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub id: String,
    pub user_id: Option<i64>,
    pub persistent: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Database-backed session registry.
#[derive(Clone)]
pub struct SessionStore {
    pool: DbPool,
    ttl: Duration,
    persistent_ttl: Duration,
}

impl SessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            ttl: DEFAULT_TTL,
            persistent_ttl: DEFAULT_PERSISTENT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration, persistent_ttl: Duration) -> Self {
        self.ttl = ttl;
        self.persistent_ttl = persistent_ttl;
        self
    }

    fn conn(&self) -> Result<crate::store::PooledConnection> {
        self.pool
            .get()
            .map_err(|e| UdbError::Pool(format!("Failed to get connection: {}", e)))
    }

    /// Issue a new session for a user.
    pub fn open(&self, user_id: i64, persistent: bool) -> Result<AuthSession> {
        let now = Utc::now();
        let ttl = if persistent { self.persistent_ttl } else { self.ttl };
        let session = AuthSession {
            id: Uuid::new_v4().to_string(),
            user_id: Some(user_id),
            persistent,
            created_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1)),
        };
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO authsession (id, user_id, persistent, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                session.id,
                session.user_id,
                session.persistent,
                session.created_at.to_rfc3339(),
                session.expires_at.to_rfc3339()
            ],
        )?;
        Ok(session)
    }

    /// Resolve a session token. Expired or logged-out sessions resolve to
    /// `None`; expired rows are dropped on sight.
    pub fn get(&self, id: &str) -> Result<Option<AuthSession>> {
        let conn = self.conn()?;
        let row: Option<(Option<i64>, bool, String, String)> = conn
            .query_row(
                "SELECT user_id, persistent, created_at, expires_at
                 FROM authsession WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        let Some((user_id, persistent, created_raw, expires_raw)) = row else {
            return Ok(None);
        };
        let parse = |raw: &str| {
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| UdbError::Fatal(format!("corrupted session timestamp: {e}")))
        };
        let expires_at = parse(&expires_raw)?;
        if expires_at <= Utc::now() {
            conn.execute("DELETE FROM authsession WHERE id = ?1", [id])?;
            return Ok(None);
        }
        if user_id.is_none() {
            return Ok(None);
        }
        Ok(Some(AuthSession {
            id: id.to_string(),
            user_id,
            persistent,
            created_at: parse(&created_raw)?,
            expires_at,
        }))
    }

    /// Clear the session's user binding; the row survives for reuse.
    pub fn logout(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("UPDATE authsession SET user_id = NULL WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Drop expired rows; a maintenance sweep for external schedulers.
    pub fn purge_expired(&self) -> Result<usize> {
        let conn = self.conn()?;
        let purged = conn.execute(
            "DELETE FROM authsession WHERE expires_at <= ?1",
            [Utc::now().to_rfc3339()],
        )?;
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::open_temp;

    fn store_with_user() -> (tempfile::TempDir, SessionStore, i64) {
        let (guard, db) = open_temp();
        let conn = db.get_conn().unwrap();
        conn.execute(
            "INSERT INTO user (username, notes, status, created_at, modified_at)
             VALUES ('admin', '', 2, '2024-01-01T00:00:00+00:00', '2024-01-01T00:00:00+00:00')",
            [],
        )
        .unwrap();
        let user_id = conn.last_insert_rowid();
        drop(conn);
        (guard, SessionStore::new(db.pool()), user_id)
    }

    #[test]
    fn test_open_and_resolve() {
        let (_guard, sessions, user_id) = store_with_user();
        let session = sessions.open(user_id, false).unwrap();
        let resolved = sessions.get(&session.id).unwrap().unwrap();
        assert_eq!(resolved.user_id, Some(user_id));
        assert!(!resolved.persistent);
    }

    #[test]
    fn test_unknown_token_resolves_to_none() {
        let (_guard, sessions, _user_id) = store_with_user();
        assert!(sessions.get("not-a-session").unwrap().is_none());
    }

    #[test]
    fn test_persistent_sessions_live_longer() {
        let (_guard, sessions, user_id) = store_with_user();
        let short = sessions.open(user_id, false).unwrap();
        let long = sessions.open(user_id, true).unwrap();
        assert!(long.expires_at > short.expires_at);
    }

    #[test]
    fn test_logout_clears_user_binding() {
        let (_guard, sessions, user_id) = store_with_user();
        let session = sessions.open(user_id, false).unwrap();
        sessions.logout(&session.id).unwrap();
        assert!(sessions.get(&session.id).unwrap().is_none());
    }

    #[test]
    fn test_expired_sessions_are_dropped() {
        let (_guard, db) = open_temp();
        let conn = db.get_conn().unwrap();
        conn.execute(
            "INSERT INTO authsession (id, user_id, persistent, created_at, expires_at)
             VALUES ('stale', NULL, 0, '2020-01-01T00:00:00+00:00', '2020-01-01T01:00:00+00:00')",
            [],
        )
        .unwrap();
        drop(conn);
        let sessions = SessionStore::new(db.pool());
        assert!(sessions.get("stale").unwrap().is_none());
        assert_eq!(sessions.purge_expired().unwrap(), 0);
    }
}
