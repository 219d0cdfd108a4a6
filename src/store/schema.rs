// src/store/schema.rs

//! Record-store schema definitions and migrations

use crate::error::Result;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    debug!("current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("applying store migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        2 => migrate_v2(conn),
        _ => panic!("Unknown migration version: {}", version),
    }
}

/// Initial schema - Version 1
///
/// - apps: one row per application id, holding the type binding and the
///   shared storage sub-path
/// - installed_apps: one row per installed version
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE apps (
            idx INTEGER PRIMARY KEY AUTOINCREMENT,
            type TEXT NOT NULL,
            app_id TEXT NOT NULL UNIQUE,
            data_path TEXT NOT NULL
        );

        CREATE INDEX idx_apps_app_id ON apps(app_id);

        CREATE TABLE installed_apps (
            idx INTEGER PRIMARY KEY AUTOINCREMENT,
            app_idx INTEGER NOT NULL,
            version TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            category TEXT NOT NULL DEFAULT '',
            url TEXT NOT NULL DEFAULT '',
            app_path TEXT NOT NULL,
            created TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(app_idx, version),
            FOREIGN KEY (app_idx) REFERENCES apps(idx) ON DELETE CASCADE
        );

        CREATE INDEX idx_installed_apps_app_idx ON installed_apps(app_idx);
        ",
    )?;
    Ok(())
}

/// Schema Version 2: per-version free-form metadata
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE metadata (
            idx INTEGER PRIMARY KEY AUTOINCREMENT,
            installed_idx INTEGER NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            UNIQUE(installed_idx, key),
            FOREIGN KEY (installed_idx) REFERENCES installed_apps(idx) ON DELETE CASCADE
        );

        CREATE INDEX idx_metadata_installed_idx ON metadata(installed_idx);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::result::Result as StdResult;

    fn create_test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        conn
    }

    #[test]
    fn test_migrate_creates_all_tables() {
        let conn = create_test_db();
        migrate(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<StdResult<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"apps".to_string()));
        assert!(tables.contains(&"installed_apps".to_string()));
        assert!(tables.contains(&"metadata".to_string()));
        assert!(tables.contains(&"schema_version".to_string()));
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = create_test_db();

        migrate(&conn).unwrap();
        let version1 = get_schema_version(&conn).unwrap();

        migrate(&conn).unwrap();
        let version2 = get_schema_version(&conn).unwrap();

        assert_eq!(version1, version2);
        assert_eq!(version1, SCHEMA_VERSION);
    }

    #[test]
    fn test_app_id_unique_constraint() {
        let conn = create_test_db();
        migrate(&conn).unwrap();

        conn.execute(
            "INSERT INTO apps (type, app_id, data_path) VALUES (?1, ?2, ?3)",
            ["application/bundle", "com.example.app", "com.example.app/"],
        )
        .unwrap();

        let duplicate = conn.execute(
            "INSERT INTO apps (type, app_id, data_path) VALUES (?1, ?2, ?3)",
            ["application/other", "com.example.app", "com.example.app/"],
        );
        assert!(duplicate.is_err());
    }

    #[test]
    fn test_installed_version_cascade_delete() {
        let conn = create_test_db();
        migrate(&conn).unwrap();

        conn.execute(
            "INSERT INTO apps (type, app_id, data_path) VALUES ('t', 'a', 'a/')",
            [],
        )
        .unwrap();
        let app_idx = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO installed_apps (app_idx, version, app_path) VALUES (?1, '1.0', 'a/1.0/')",
            [app_idx],
        )
        .unwrap();

        conn.execute("DELETE FROM apps WHERE idx = ?1", [app_idx])
            .unwrap();

        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM installed_apps", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }
}
