//! Storage layer
//!
//! Pooled SQLite database with ordered migrations, the CIDR SQL functions
//! used by filters and rule statements, and the typed repository over the
//! entity tables.

pub mod functions;
mod repository;
mod schema;

use std::path::Path;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::error::{Result, UdbError};

pub use repository::{insert_entity, update_entity, Filter, Paging, Store};
pub(crate) use repository::insert_message;

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;
/// A connection checked out of the pool
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Database handle owning the connection pool and migration state
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| UdbError::Io {
                    source: e,
                    context: format!("Failed to create database directory: {:?}", parent),
                })?;
            }
        }

        // Every pooled connection gets the pragmas and the network SQL
        // functions; rule statements may call them at any time.
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA foreign_keys = ON;
                PRAGMA busy_timeout = 5000;
                ",
            )?;
            functions::register(conn)
        });

        let pool = Pool::builder()
            .max_size(16)
            .build(manager)
            .map_err(|e| UdbError::Pool(format!("Failed to create connection pool: {}", e)))?;

        let db = Self { pool };
        db.migrate()?;
        Ok(db)
    }

    /// Get a connection from the pool
    pub fn get_conn(&self) -> Result<PooledConnection> {
        self.pool
            .get()
            .map_err(|e| UdbError::Pool(format!("Failed to get connection: {}", e)))
    }

    /// Repository view over this database
    pub fn store(&self) -> Store {
        Store::new(self.pool.clone())
    }

    pub fn pool(&self) -> DbPool {
        self.pool.clone()
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM _migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        for (version, migration) in schema::MIGRATIONS.iter().enumerate() {
            let version = version as i32 + 1;

            if version > current_version {
                tracing::info!("Applying migration {}", version);
                conn.execute_batch(migration)?;
                conn.execute(
                    "INSERT INTO _migrations (version, applied_at) VALUES (?1, datetime('now'))",
                    rusqlite::params![version],
                )?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use tempfile::TempDir;

    /// Open a throw-away database; keep the [`TempDir`] alive for the test.
    pub fn open_temp() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(&temp_dir.path().join("test.db")).unwrap();
        (temp_dir, db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_creation() {
        let (temp_dir, _db) = testutil::open_temp();
        assert!(temp_dir.path().join("test.db").exists());
    }

    #[test]
    fn test_migrations_applied() {
        let (_guard, db) = testutil::open_temp();
        let conn = db.get_conn().unwrap();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM _migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, schema::MIGRATIONS.len() as i32);
    }

    #[test]
    fn test_schema_tables_exist() {
        let (_guard, db) = testutil::open_temp();
        let conn = db.get_conn().unwrap();

        for table in [
            "user",
            "vrf",
            "subnet",
            "subnet_range",
            "dnszone",
            "dnszone_subnet",
            "dnsrecord",
            "dhcprecord",
            "ip",
            "mac",
            "rule",
            "rule_violation",
            "message",
            "follower",
            "ratelimit",
            "authsession",
            "search_index",
            "message_search",
        ] {
            let count: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_foreign_keys_enabled() {
        let (_guard, db) = testutil::open_temp();
        let conn = db.get_conn().unwrap();
        let fk_enabled: i32 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk_enabled, 1);
    }
}
