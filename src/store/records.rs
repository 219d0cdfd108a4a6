// src/store/records.rs

//! Record types and queries for the package store
//!
//! Query arguments follow the platform convention that an empty string acts
//! as a wildcard, so reconciliation can ask about an `(id, version)` pair
//! without knowing its type.

use crate::error::{Error, Result};
use crate::store::Store;
use rusqlite::{OptionalExtension, params, params_from_iter};

/// Identity of a package: `id` is globally unique across types,
/// `(id, version)` is the installed-package key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageId {
    pub pkg_type: String,
    pub id: String,
    pub version: String,
}

impl PackageId {
    pub fn new(pkg_type: &str, id: &str, version: &str) -> Self {
        Self {
            pkg_type: pkg_type.to_string(),
            id: id.to_string(),
            version: version.to_string(),
        }
    }
}

impl std::fmt::Display for PackageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "app[{}:{}]", self.id, self.version)
    }
}

/// A record to persist on successful install
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub pkg_type: String,
    pub id: String,
    pub version: String,
    pub name: String,
    pub category: String,
    pub url: String,
    /// Content sub-path relative to the apps root
    pub app_path: String,
    /// Shared-storage sub-path relative to the data root
    pub data_path: String,
}

/// Installed-app details as returned by listings
///
/// `version` is empty for an id whose versions were all upgrade-uninstalled
/// but whose shared storage still exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppDetails {
    pub pkg_type: String,
    pub id: String,
    pub version: String,
    pub name: String,
    pub category: String,
    pub url: String,
}

/// Listing filter; empty fields match anything
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub pkg_type: String,
    pub id: String,
    pub version: String,
    pub name: String,
    pub category: String,
}

fn filter_clause(sql: &mut String, args: &mut Vec<String>, column: &str, value: &str) {
    if !value.is_empty() {
        sql.push_str(" AND ");
        sql.push_str(column);
        sql.push_str(" = ?");
        args.push(value.to_string());
    }
}

impl Store {
    /// Persist a new installed-app record
    ///
    /// Creates the per-id row on first install of any version of `id`.
    pub fn add_record(&self, rec: &NewRecord) -> Result<()> {
        let conn = self.conn();

        let existing: Option<i64> = conn
            .query_row(
                "SELECT idx FROM apps WHERE app_id = ?1",
                [&rec.id],
                |row| row.get(0),
            )
            .optional()?;

        let app_idx = match existing {
            Some(idx) => idx,
            None => {
                conn.execute(
                    "INSERT INTO apps (type, app_id, data_path) VALUES (?1, ?2, ?3)",
                    params![&rec.pkg_type, &rec.id, &rec.data_path],
                )?;
                conn.last_insert_rowid()
            }
        };

        conn.execute(
            "INSERT INTO installed_apps (app_idx, version, name, category, url, app_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                app_idx,
                &rec.version,
                &rec.name,
                &rec.category,
                &rec.url,
                &rec.app_path,
            ],
        )?;
        Ok(())
    }

    /// Remove one installed version's record; the per-id row survives
    pub fn remove_record(&self, pkg_type: &str, id: &str, version: &str) -> Result<()> {
        let mut sql = String::from(
            "DELETE FROM installed_apps WHERE idx IN (
                SELECT i.idx FROM installed_apps i JOIN apps a ON i.app_idx = a.idx
                WHERE a.app_id = ? AND i.version = ?",
        );
        let mut args = vec![id.to_string(), version.to_string()];
        filter_clause(&mut sql, &mut args, "a.type", pkg_type);
        sql.push(')');

        self.conn().execute(&sql, params_from_iter(args.iter()))?;
        Ok(())
    }

    /// Remove the per-id row (and any dangling version rows with it)
    pub fn remove_all_data_for(&self, pkg_type: &str, id: &str) -> Result<()> {
        let mut sql = String::from("DELETE FROM apps WHERE app_id = ?");
        let mut args = vec![id.to_string()];
        filter_clause(&mut sql, &mut args, "type", pkg_type);

        self.conn().execute(&sql, params_from_iter(args.iter()))?;
        Ok(())
    }

    /// True if a matching installed version exists; empty fields are wildcards
    pub fn is_installed(&self, pkg_type: &str, id: &str, version: &str) -> Result<bool> {
        let mut sql = String::from(
            "SELECT COUNT(*) FROM installed_apps i JOIN apps a ON i.app_idx = a.idx WHERE 1=1",
        );
        let mut args = Vec::new();
        filter_clause(&mut sql, &mut args, "a.type", pkg_type);
        filter_clause(&mut sql, &mut args, "a.app_id", id);
        filter_clause(&mut sql, &mut args, "i.version", version);

        let count: i64 =
            self.conn()
                .query_row(&sql, params_from_iter(args.iter()), |row| row.get(0))?;
        Ok(count > 0)
    }

    /// The type an id is bound to, if any version was ever installed
    pub fn type_of(&self, id: &str) -> Result<Option<String>> {
        let pkg_type = self
            .conn()
            .query_row("SELECT type FROM apps WHERE app_id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(pkg_type)
    }

    /// Content sub-paths of matching installed versions
    pub fn content_paths(&self, pkg_type: &str, id: &str, version: &str) -> Result<Vec<String>> {
        let mut sql = String::from(
            "SELECT i.app_path FROM installed_apps i JOIN apps a ON i.app_idx = a.idx WHERE 1=1",
        );
        let mut args = Vec::new();
        filter_clause(&mut sql, &mut args, "a.type", pkg_type);
        filter_clause(&mut sql, &mut args, "a.app_id", id);
        filter_clause(&mut sql, &mut args, "i.version", version);
        sql.push_str(" ORDER BY i.version");

        let mut stmt = self.conn().prepare(&sql)?;
        let paths = stmt
            .query_map(params_from_iter(args.iter()), |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(paths)
    }

    /// Shared-storage sub-paths of matching ids
    pub fn data_paths(&self, pkg_type: &str, id: &str) -> Result<Vec<String>> {
        let mut sql = String::from("SELECT data_path FROM apps WHERE 1=1");
        let mut args = Vec::new();
        filter_clause(&mut sql, &mut args, "type", pkg_type);
        filter_clause(&mut sql, &mut args, "app_id", id);
        sql.push_str(" ORDER BY app_id");

        let mut stmt = self.conn().prepare(&sql)?;
        let paths = stmt
            .query_map(params_from_iter(args.iter()), |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(paths)
    }

    /// True if the id still owns shared storage (installed or leftover)
    pub fn has_data(&self, pkg_type: &str, id: &str) -> Result<bool> {
        Ok(!self.data_paths(pkg_type, id)?.is_empty())
    }

    /// Filtered listing over apps and their installed versions
    ///
    /// Outer join, so an id with shared storage but no installed versions
    /// appears once with an empty version.
    pub fn list(&self, filter: &RecordFilter) -> Result<Vec<AppDetails>> {
        let mut sql = String::from(
            "SELECT a.type, a.app_id, IFNULL(i.version, ''), IFNULL(i.name, ''),
                    IFNULL(i.category, ''), IFNULL(i.url, '')
             FROM apps a LEFT JOIN installed_apps i ON i.app_idx = a.idx
             WHERE 1=1",
        );
        let mut args = Vec::new();
        filter_clause(&mut sql, &mut args, "a.type", &filter.pkg_type);
        filter_clause(&mut sql, &mut args, "a.app_id", &filter.id);
        filter_clause(&mut sql, &mut args, "i.version", &filter.version);
        filter_clause(&mut sql, &mut args, "i.name", &filter.name);
        filter_clause(&mut sql, &mut args, "i.category", &filter.category);
        sql.push_str(" ORDER BY a.app_id, i.version");

        let mut stmt = self.conn().prepare(&sql)?;
        let details = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok(AppDetails {
                    pkg_type: row.get(0)?,
                    id: row.get(1)?,
                    version: row.get(2)?,
                    name: row.get(3)?,
                    category: row.get(4)?,
                    url: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(details)
    }

    /// Details for a single id
    pub fn details(&self, id: &str) -> Result<AppDetails> {
        let filter = RecordFilter {
            id: id.to_string(),
            ..RecordFilter::default()
        };
        self.list(&filter)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::General(format!("no app record for id '{id}'")))
    }

    fn installed_idx(&self, pkg_type: &str, id: &str, version: &str) -> Result<Option<i64>> {
        let mut sql = String::from(
            "SELECT i.idx FROM installed_apps i JOIN apps a ON i.app_idx = a.idx
             WHERE a.app_id = ? AND i.version = ?",
        );
        let mut args = vec![id.to_string(), version.to_string()];
        filter_clause(&mut sql, &mut args, "a.type", pkg_type);

        let idx = self
            .conn()
            .query_row(&sql, params_from_iter(args.iter()), |row| row.get(0))
            .optional()?;
        Ok(idx)
    }

    /// Set (or overwrite) one metadata value for an installed version
    pub fn set_metadata(
        &self,
        pkg_type: &str,
        id: &str,
        version: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let idx = self
            .installed_idx(pkg_type, id, version)?
            .ok_or_else(|| Error::General(format!("app {id}:{version} is not installed")))?;

        self.conn().execute(
            "INSERT INTO metadata (installed_idx, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(installed_idx, key) DO UPDATE SET value = excluded.value",
            params![idx, key, value],
        )?;
        Ok(())
    }

    /// Clear one metadata key, or every key when `key` is empty
    pub fn clear_metadata(&self, pkg_type: &str, id: &str, version: &str, key: &str) -> Result<()> {
        let idx = self
            .installed_idx(pkg_type, id, version)?
            .ok_or_else(|| Error::General(format!("app {id}:{version} is not installed")))?;

        if key.is_empty() {
            self.conn()
                .execute("DELETE FROM metadata WHERE installed_idx = ?1", [idx])?;
        } else {
            self.conn().execute(
                "DELETE FROM metadata WHERE installed_idx = ?1 AND key = ?2",
                params![idx, key],
            )?;
        }
        Ok(())
    }

    /// Details plus ordered metadata pairs for an installed version
    pub fn get_metadata(
        &self,
        pkg_type: &str,
        id: &str,
        version: &str,
    ) -> Result<(AppDetails, Vec<(String, String)>)> {
        let idx = self
            .installed_idx(pkg_type, id, version)?
            .ok_or_else(|| Error::General(format!("app {id}:{version} is not installed")))?;

        let details = self.details(id)?;

        let mut stmt = self
            .conn()
            .prepare("SELECT key, value FROM metadata WHERE installed_idx = ?1 ORDER BY idx")?;
        let pairs = stmt
            .query_map([idx], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok((details, pairs))
    }
}
