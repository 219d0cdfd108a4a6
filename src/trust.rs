// src/trust.rs

//! Trust-anchor loading and signature verification
//!
//! At startup every regular file in the certificate directory is parsed as a
//! minisign public key; the survivors form the immutable
//! [`VerificationBundle`] used to check bundle manifest signatures. Files
//! that fail to parse are skipped with a warning, matching the tolerant
//! loading of platform certificate drops.

use crate::error::{Error, Result};
use minisign_verify::{PublicKey, Signature};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// A single trusted signing key, named after the file it was loaded from
#[derive(Debug)]
pub struct TrustAnchor {
    name: String,
    key: PublicKey,
}

/// Immutable set of trust anchors used to validate package signatures
#[derive(Debug)]
pub struct VerificationBundle {
    anchors: Vec<TrustAnchor>,
}

impl VerificationBundle {
    /// Bundle with no anchors, for the explicitly unverified mode
    pub fn empty() -> Self {
        Self { anchors: Vec::new() }
    }

    /// Load every public key file in `dir`
    ///
    /// Fails if the directory is missing or no key could be loaded; a
    /// manager that cannot verify anything must not start in verified mode.
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::VerificationFailed(format!(
                "certificate directory does not exist: {}",
                dir.display()
            )));
        }

        let mut anchors = Vec::new();
        let entries = fs::read_dir(dir).map_err(Error::from)?;
        for entry in entries {
            let entry = entry.map_err(Error::from)?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match load_key_file(&path) {
                Ok(key) => {
                    debug!("loaded trust anchor from {}", path.display());
                    anchors.push(TrustAnchor { name, key });
                }
                Err(e) => warn!("skipping certificate file {}: {e}", path.display()),
            }
        }

        if anchors.is_empty() {
            return Err(Error::VerificationFailed(format!(
                "no trust anchors loaded from {}",
                dir.display()
            )));
        }
        Ok(Self { anchors })
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    /// Verify `content` against a full minisign signature string
    ///
    /// Tries every anchor; returns the name of the one that verified.
    pub fn verify(&self, content: &[u8], signature: &str) -> Result<String> {
        if self.anchors.is_empty() {
            return Err(Error::VerificationFailed(
                "no trust anchors available".to_string(),
            ));
        }

        let signature = Signature::decode(signature)
            .map_err(|e| Error::VerificationFailed(format!("invalid signature format: {e}")))?;

        let mut last_error = None;
        for anchor in &self.anchors {
            match anchor.key.verify(content, &signature, false) {
                Ok(()) => return Ok(anchor.name.clone()),
                Err(e) => last_error = Some(format!("{e}")),
            }
        }

        Err(Error::VerificationFailed(format!(
            "signature did not verify against {} trust anchors: {}",
            self.anchors.len(),
            last_error.unwrap_or_else(|| "unknown".to_string())
        )))
    }
}

/// Parse a minisign public key file
///
/// Accepts both the two-line `minisign.pub` layout (untrusted comment plus
/// base64) and a bare base64 line.
fn load_key_file(path: &Path) -> Result<PublicKey> {
    let contents = fs::read_to_string(path).map_err(Error::from)?;
    let encoded = contents
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with("untrusted comment:"))
        .ok_or_else(|| Error::VerificationFailed("no key data in file".to_string()))?;

    PublicKey::from_base64(encoded)
        .map_err(|e| Error::VerificationFailed(format!("invalid public key: {e}")))
}
