//! Embedded SQLite persistence.
//!
//! The `Database` handle is the only shared mutable state in the
//! process: every daemon reads through its typed query methods and
//! writes through named mutators. Multi-statement mutators run inside
//! a transaction and roll back on any failure.

mod connections;
mod history;
mod profiles;
mod queue;
mod roots;
mod schedule;
mod schema;
mod settings;
mod watches;

use std::path::Path;
use std::sync::Mutex;

use chrono::{Local, NaiveDateTime};
use rusqlite::Connection;
use tracing::info;

use crate::error::{StorageError, StorageResult};
use crate::sync_ext::MutexExt;

pub use history::StatsDashboard;
pub use queue::NewQueueItem;
pub use roots::ScanRootDraft;
pub use watches::FolderWatchDraft;

const STAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Local wall-clock timestamp in the persisted text format.
pub fn now_stamp() -> String {
    Local::now().format(STAMP_FORMAT).to_string()
}

/// Parse a persisted timestamp back into a naive local datetime.
pub fn parse_stamp(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, STAMP_FORMAT).ok()
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open (creating if necessary) the database at `path` and bring
    /// its schema up to date. Parent directories are created first.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let db = Self::from_connection(conn)?;
        info!(path = %path.display(), "database ready");
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        // journal_mode answers with the resulting mode, so it must be
        // read as a query. In-memory databases stay on "memory".
        let _: Result<String, _> =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0));
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let guard = self.conn.lock_unpoisoned();
        f(&guard)
    }

    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut guard = self.conn.lock_unpoisoned();
        let tx = guard.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// Rewrap SQLite constraint failures so callers see the invariant
/// breach rather than a transport error.
pub(crate) fn map_constraint(err: rusqlite::Error, what: &str) -> StorageError {
    match &err {
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StorageError::ConstraintViolation(format!("{what}: {err}"))
        }
        _ => StorageError::Database(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_round_trip() {
        let stamp = now_stamp();
        assert!(parse_stamp(&stamp).is_some());
        assert!(parse_stamp("not a stamp").is_none());
    }

    #[test]
    fn open_in_memory_initialises_schema() {
        let db = Database::open_in_memory().unwrap();
        // Schema bootstrap seeds the schedule singleton.
        let schedule = db.schedule().unwrap();
        assert!(!schedule.enabled);
        assert_eq!(schedule.start_time, "22:00");
        assert_eq!(schedule.end_time, "06:00");
        assert_eq!(schedule.max_concurrent_jobs, 1);
    }

    #[test]
    fn reopening_is_additive_not_destructive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recodarr.db");
        {
            let db = Database::open(&path).unwrap();
            db.set_setting("resource_cpu_threshold", "80.0").unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(
            db.setting("resource_cpu_threshold").unwrap().as_deref(),
            Some("80.0")
        );
    }
}
