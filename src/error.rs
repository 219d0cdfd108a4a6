// src/error.rs

use thiserror::Error;

/// Core error taxonomy for Berth
///
/// Collaborator failures (store, filesystem, JSON) are folded into `General`
/// so callers only ever match on these kinds.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed, missing, or unsafe parameters
    #[error("wrong parameters: {0}")]
    WrongParams(String),

    /// The `(id, version)` pair is already recorded
    #[error("already installed: {id} {version}")]
    AlreadyInstalled { id: String, version: String },

    /// Uninstall blocked by an outstanding lock
    #[error("app is locked: {id} {version}")]
    AppLocked { id: String, version: String },

    /// No installed version satisfies a declared constraint
    #[error("no installed version of '{id}' satisfies '{range}'")]
    DependencyUnresolved { id: String, range: String },

    /// Signature or trust-anchor failure
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// Caller-supplied identity disagrees with the package's own
    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: String, found: String },

    /// I/O, store, or mount failure
    #[error("{0}")]
    General(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::General(format!("store error: {err}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::General(format!("i/o error: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::General(format!("json error: {err}"))
    }
}

/// Result type alias using Berth's Error type
pub type Result<T> = std::result::Result<T, Error>;
