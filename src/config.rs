// src/config.rs

//! Runtime configuration for Berth
//!
//! The platform hands the manager a single JSON configuration string at
//! startup. Every key is optional; unknown keys are ignored. All directory
//! values fall back to the embedded defaults below.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Parsed configuration with embedded-platform defaults
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for extracted application content, one `<id>/<version>/` tree each
    #[serde(rename = "appspath")]
    apps_path: String,

    /// Directory holding the record-store database file
    #[serde(rename = "dbpath")]
    db_path: String,

    /// Root for per-id persistent storage directories
    #[serde(rename = "datapath")]
    data_path: String,

    /// Directory of trust-anchor key files loaded at startup
    #[serde(rename = "certspath")]
    certs_path: String,

    /// Root under which locked packages are mounted
    #[serde(rename = "mountspath")]
    mounts_path: String,

    /// Root for installed package images, one `<id>/<version>/` tree each
    #[serde(rename = "imagespath")]
    images_path: String,

    /// Name of the bundled annotations file inside extracted content;
    /// empty disables the import
    #[serde(rename = "annotationsFile")]
    annotations_file: String,

    /// Regex allowlist applied to annotation keys during import
    #[serde(rename = "annotationsRegex")]
    annotations_regex: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            apps_path: "/var/lib/berth/apps".to_string(),
            db_path: "/var/lib/berth/db".to_string(),
            data_path: "/var/lib/berth/data".to_string(),
            certs_path: "/etc/berth/certs".to_string(),
            mounts_path: "/run/berth/mounts".to_string(),
            images_path: "/var/lib/berth/images".to_string(),
            annotations_file: String::new(),
            annotations_regex: String::new(),
        }
    }
}

impl Config {
    /// Parse the configuration string handed to `Initialize`
    ///
    /// An empty or whitespace-only string yields the defaults. Anything else
    /// must be a JSON object.
    pub fn from_json(config: &str) -> Result<Self> {
        if config.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(config)
            .map_err(|e| Error::WrongParams(format!("invalid configuration: {e}")))
    }

    pub fn apps_path(&self) -> PathBuf {
        PathBuf::from(&self.apps_path)
    }

    /// Scratch root recreated empty by every reconciliation pass
    pub fn apps_tmp_path(&self) -> PathBuf {
        self.apps_path().join("tmp")
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.db_path)
    }

    /// Full path of the record-store database file
    pub fn db_file(&self) -> PathBuf {
        self.db_path().join("berth.db")
    }

    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(&self.data_path)
    }

    pub fn certs_path(&self) -> PathBuf {
        PathBuf::from(&self.certs_path)
    }

    pub fn mounts_path(&self) -> PathBuf {
        PathBuf::from(&self.mounts_path)
    }

    pub fn images_path(&self) -> PathBuf {
        PathBuf::from(&self.images_path)
    }

    pub fn annotations_file(&self) -> &str {
        &self.annotations_file
    }

    pub fn annotations_regex(&self) -> &str {
        &self.annotations_regex
    }

    /// Absolute path of an app's annotations file, if imports are enabled
    pub fn annotations_path(&self, content_dir: &Path) -> Option<PathBuf> {
        if self.annotations_file.is_empty() {
            None
        } else {
            Some(content_dir.join(&self.annotations_file))
        }
    }
}
