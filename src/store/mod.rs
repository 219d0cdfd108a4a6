// src/store/mod.rs

//! Persisted record store for installed packages
//!
//! SQLite-backed table of installed package identities, their on-disk
//! sub-paths, and free-form per-version metadata. The store is the single
//! source of truth for *installed* state; reconciliation repairs any
//! disagreement with the filesystem.

pub mod records;
pub mod schema;

pub use records::{AppDetails, NewRecord, PackageId, RecordFilter};

use crate::error::{Error, Result};
use rusqlite::Connection;
use std::path::Path;
use tracing::debug;

/// Handle over the record-store database
///
/// Not internally synchronized; the orchestrator serializes access behind
/// its task mutex.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if necessary) the store at `db_file` and migrate it
    pub fn open(db_file: &Path) -> Result<Self> {
        debug!("opening record store at {}", db_file.display());

        if let Some(parent) = db_file.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::General(format!("failed to create store directory: {e}"))
            })?;
        }

        let conn = Connection::open(db_file)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    /// Open an in-memory store, for tests
    #[cfg(test)]
    pub(crate) fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_database_and_parents() {
        let root = tempdir().unwrap();
        let db_file = root.path().join("nested/db/berth.db");

        let store = Store::open(&db_file);
        assert!(store.is_ok());
        assert!(db_file.exists());
    }

    #[test]
    fn test_open_is_idempotent() {
        let root = tempdir().unwrap();
        let db_file = root.path().join("berth.db");

        Store::open(&db_file).unwrap();
        let reopened = Store::open(&db_file);
        assert!(reopened.is_ok());
    }

    #[test]
    fn test_pragmas_are_set() {
        let root = tempdir().unwrap();
        let store = Store::open(&root.path().join("berth.db")).unwrap();

        let foreign_keys: i32 = store
            .conn()
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(foreign_keys, 1);

        let journal_mode: String = store
            .conn()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");
    }
}
