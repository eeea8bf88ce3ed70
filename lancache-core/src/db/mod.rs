//! Embedded relational store for downloads, log entries, rollup stats, and
//! Steam depot mappings. Backed by SQLite (`rusqlite`, bundled), matching
//! the schema shape real companion tooling for this system already expects:
//! tables named `Downloads`, `LogEntries`, `ClientStats`, `ServiceStats`,
//! and `SteamDepotMappings`.

pub mod downloads;
pub mod mappings;
pub mod stats;

use std::fmt;
use std::path::Path;

use rusqlite::Connection;

/// Errors raised by the relational store. Wraps `rusqlite::Error` without
/// discarding it, so callers can still match on the underlying SQLite
/// error code if they need to.
#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::Sqlite(e) => write!(f, "database error: {e}"),
        }
    }
}

impl std::error::Error for DbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DbError::Sqlite(e) => Some(e),
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(e: rusqlite::Error) -> Self {
        DbError::Sqlite(e)
    }
}

pub type DbResult<T> = Result<T, DbError>;

const SCHEMA_VERSION: i64 = 1;

/// Thin wrapper around a `rusqlite::Connection` opened against
/// `LancacheManager.db`. Not `Sync`; the log processor, sweeper, and
/// crawler each open their own connection and scope their own short-lived
/// units of work rather than sharing one across threads.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens (creating if absent) the database at `path` and brings the
    /// schema up to date.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Opens an in-memory database, used by tests.
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn migrate(&self) -> DbResult<()> {
        let current: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if current < 1 {
            self.conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS Downloads (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    service TEXT NOT NULL,
                    client_ip TEXT NOT NULL,
                    depot_id INTEGER,
                    game_app_id INTEGER,
                    game_name TEXT,
                    game_image_url TEXT,
                    last_url TEXT,
                    start_time TEXT NOT NULL,
                    end_time TEXT NOT NULL,
                    cache_hit_bytes INTEGER NOT NULL DEFAULT 0,
                    cache_miss_bytes INTEGER NOT NULL DEFAULT 0,
                    is_active INTEGER NOT NULL DEFAULT 1
                );
                CREATE INDEX IF NOT EXISTS idx_downloads_active_lookup
                    ON Downloads (client_ip, service, depot_id, is_active);
                CREATE INDEX IF NOT EXISTS idx_downloads_resolution
                    ON Downloads (depot_id, game_app_id);

                CREATE TABLE IF NOT EXISTS LogEntries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    download_id INTEGER NOT NULL REFERENCES Downloads(id),
                    timestamp TEXT NOT NULL,
                    client_ip TEXT NOT NULL,
                    service TEXT NOT NULL,
                    url TEXT NOT NULL,
                    status_code INTEGER NOT NULL,
                    bytes_served INTEGER NOT NULL,
                    cache_status TEXT NOT NULL,
                    depot_id INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_log_entries_download
                    ON LogEntries (download_id);

                CREATE TABLE IF NOT EXISTS ClientStats (
                    client_ip TEXT PRIMARY KEY,
                    total_hit_bytes INTEGER NOT NULL DEFAULT 0,
                    total_miss_bytes INTEGER NOT NULL DEFAULT 0,
                    last_seen TEXT,
                    total_downloads INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS ServiceStats (
                    service TEXT PRIMARY KEY,
                    total_hit_bytes INTEGER NOT NULL DEFAULT 0,
                    total_miss_bytes INTEGER NOT NULL DEFAULT 0,
                    last_seen TEXT,
                    total_downloads INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS SteamDepotMappings (
                    depot_id INTEGER NOT NULL,
                    app_id INTEGER NOT NULL,
                    app_name TEXT,
                    source TEXT NOT NULL,
                    is_owner INTEGER NOT NULL DEFAULT 0,
                    discovered_at TEXT NOT NULL,
                    PRIMARY KEY (depot_id, app_id)
                );
                ",
            )?;
            self.conn
                .pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_creates_schema() {
        let db = Database::open_in_memory().unwrap();
        let count: i64 = db
            .connection()
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='Downloads'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn migrate_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db.migrate().unwrap();
    }
}
