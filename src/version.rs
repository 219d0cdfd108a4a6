// src/version.rs

//! Version parsing and constraint matching
//!
//! Installed versions on the platform are frequently two-part strings like
//! `"1.2"`; `parse_version` pads them out so `semver` can compare them.
//! Dependency ranges use the `semver` requirement grammar (`>=1.0`, `=2.1.3`,
//! `1.*`, ...).

use crate::error::{Error, Result};
use semver::{Version, VersionReq};

/// Parse a version string, padding missing components with zeros
pub fn parse_version(version: &str) -> Result<Version> {
    let version = version.trim();
    Version::parse(version)
        .or_else(|_| Version::parse(&format!("{version}.0")))
        .or_else(|_| Version::parse(&format!("{version}.0.0")))
        .map_err(|_| Error::WrongParams(format!("invalid version '{version}'")))
}

/// Parse a dependency version range
pub fn parse_range(range: &str) -> Result<VersionReq> {
    VersionReq::parse(range.trim())
        .map_err(|e| Error::WrongParams(format!("invalid version range '{range}': {e}")))
}

/// True if `version` (leniently parsed) satisfies `range`
pub fn satisfies(range: &VersionReq, version: &str) -> bool {
    match parse_version(version) {
        Ok(v) => range.matches(&v),
        Err(_) => false,
    }
}
