// src/fsutil.rs

//! Filesystem helpers for staging and reconciliation
//!
//! Thin wrappers over `std::fs` that tolerate already-absent targets, plus
//! `ScopedDir`, the commit-on-success guard used for every staged directory
//! mutation: the directory is removed on drop unless `commit()` was called.

use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Create a directory and any missing parents
pub fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| Error::General(format!("failed to create {}: {e}", path.display())))
}

/// Remove a directory tree; a missing directory is not an error
pub fn remove_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    fs::remove_dir_all(path)
        .map_err(|e| Error::General(format!("failed to remove {}: {e}", path.display())))
}

pub fn dir_exists(path: &Path) -> bool {
    path.is_dir()
}

/// True if the directory exists and has no entries
pub fn is_empty(path: &Path) -> Result<bool> {
    let mut entries = fs::read_dir(path)
        .map_err(|e| Error::General(format!("failed to read {}: {e}", path.display())))?;
    Ok(entries.next().is_none())
}

/// Names of the immediate subdirectories of `path`, sorted
///
/// A missing root yields an empty list so reconciliation scans stay total.
pub fn subdirectories(path: &Path) -> Result<Vec<String>> {
    if !path.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    let entries = fs::read_dir(path)
        .map_err(|e| Error::General(format!("failed to read {}: {e}", path.display())))?;
    for entry in entries {
        let entry = entry.map_err(Error::from)?;
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Total size in bytes of all regular files under `path`
///
/// A missing directory counts as zero.
pub fn dir_space(path: &Path) -> Result<u64> {
    if !path.is_dir() {
        return Ok(0);
    }
    let mut total = 0u64;
    let entries = fs::read_dir(path)
        .map_err(|e| Error::General(format!("failed to read {}: {e}", path.display())))?;
    for entry in entries {
        let entry = entry.map_err(Error::from)?;
        let sub = entry.path();
        if sub.is_dir() {
            total += dir_space(&sub)?;
        } else if let Ok(meta) = entry.metadata() {
            total += meta.len();
        }
    }
    Ok(total)
}

/// True if `segment` is usable as a single path component
///
/// Rejects empty strings, separators, `.` and `..`, and NUL bytes — anything
/// that could escape the directory it names a child of.
pub fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains('/')
        && !segment.contains('\\')
        && !segment.contains('\0')
}

/// A staged directory removed on drop unless committed
///
/// Creating the guard creates the directory (and parents). Every exit path
/// that skips `commit()` removes it again, which keeps multi-step directory
/// population safe under failure. A directory that already existed is never
/// removed: the guard only ever undoes its own staging.
#[derive(Debug)]
pub struct ScopedDir {
    path: PathBuf,
    committed: bool,
}

impl ScopedDir {
    pub fn create(path: &Path) -> Result<Self> {
        let preexisting = path.is_dir();
        create_dir(path)?;
        debug!("staged directory {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            committed: preexisting,
        })
    }

    /// Keep the directory past the guard's lifetime
    pub fn commit(&mut self) {
        self.committed = true;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopedDir {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        debug!("removing uncommitted directory {}", self.path.display());
        if let Err(e) = remove_dir(&self.path) {
            warn!("failed to clean up staged directory: {e}");
        }
    }
}
