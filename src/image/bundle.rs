// src/image/bundle.rs

//! Bundle image format
//!
//! A bundle is a gzip-compressed tarball with three kinds of entries:
//!
//! - `manifest.json` — identity, dependency constraints, the embedded
//!   configuration document, and a SHA-256 digest per payload entry
//! - `manifest.sig` — optional detached minisign signature over the exact
//!   manifest bytes, produced off-device by the signing pipeline
//! - `rootfs/...` — the package content
//!
//! `verify` always checks payload digests against the manifest; in verified
//! mode the manifest signature must additionally check out against a trust
//! anchor. Mounting materializes `rootfs/` at the mount point.

use crate::error::{Error, Result};
use crate::fsutil;
use crate::image::{ImageDependency, ImageOpener, MountHandle, OpenMode, PackageImage};
use crate::trust::VerificationBundle;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tar::Archive;
use tracing::debug;

pub const MANIFEST_NAME: &str = "manifest.json";
pub const SIGNATURE_NAME: &str = "manifest.sig";
pub const PAYLOAD_PREFIX: &str = "rootfs/";

/// Identity and content description carried inside every bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleManifest {
    pub id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<ManifestDependency>,
    /// Payload entry path -> SHA-256 hex digest
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestDependency {
    pub id: String,
    /// Version range the dependency must satisfy
    #[serde(rename = "version")]
    pub range: String,
}

/// Opens bundle images against a fixed trust bundle and open mode
pub struct BundleOpener {
    trust: Arc<VerificationBundle>,
    mode: OpenMode,
}

impl BundleOpener {
    pub fn new(trust: VerificationBundle, mode: OpenMode) -> Self {
        Self {
            trust: Arc::new(trust),
            mode,
        }
    }
}

impl ImageOpener for BundleOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn PackageImage>> {
        let (manifest_bytes, signature) = read_control_entries(path)?;

        let manifest_bytes = manifest_bytes.ok_or_else(|| {
            Error::VerificationFailed(format!("no manifest in {}", path.display()))
        })?;
        let manifest: BundleManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| Error::VerificationFailed(format!("malformed manifest: {e}")))?;

        if !fsutil::is_safe_segment(&manifest.id) || !fsutil::is_safe_segment(&manifest.version) {
            return Err(Error::VerificationFailed(format!(
                "unsafe identity in manifest: '{}' '{}'",
                manifest.id, manifest.version
            )));
        }

        let dependencies = manifest
            .dependencies
            .iter()
            .map(|dep| ImageDependency {
                id: dep.id.clone(),
                range: dep.range.clone(),
            })
            .collect();

        debug!(
            "opened bundle {} ({}:{})",
            path.display(),
            manifest.id,
            manifest.version
        );
        Ok(Box::new(BundleImage {
            path: path.to_path_buf(),
            manifest,
            manifest_bytes,
            signature,
            dependencies,
            trust: Arc::clone(&self.trust),
            mode: self.mode,
        }))
    }
}

/// An opened bundle; payload stays on disk and is re-read per operation
#[derive(Debug)]
pub struct BundleImage {
    path: PathBuf,
    manifest: BundleManifest,
    manifest_bytes: Vec<u8>,
    signature: Option<String>,
    dependencies: Vec<ImageDependency>,
    trust: Arc<VerificationBundle>,
    mode: OpenMode,
}

impl PackageImage for BundleImage {
    fn id(&self) -> &str {
        &self.manifest.id
    }

    fn version(&self) -> &str {
        &self.manifest.version
    }

    fn dependencies(&self) -> &[ImageDependency] {
        &self.dependencies
    }

    fn verify(&self) -> Result<()> {
        self.verify_payload_digests()?;

        match self.mode {
            OpenMode::Unverified => {
                debug!("skipping signature check for {} (unverified mode)", self.path.display());
            }
            OpenMode::Verified => {
                let signature = self.signature.as_deref().ok_or_else(|| {
                    Error::VerificationFailed(format!("bundle is unsigned: {}", self.path.display()))
                })?;
                let anchor = self.trust.verify(&self.manifest_bytes, signature)?;
                debug!("bundle {} verified by anchor '{anchor}'", self.path.display());
            }
        }
        Ok(())
    }

    fn mount(&self, mount_point: &Path) -> Result<Box<dyn MountHandle>> {
        fsutil::create_dir(mount_point)?;

        let mut archive = open_archive(&self.path)?;
        for entry in archive.entries().map_err(Error::from)? {
            let mut entry = entry.map_err(Error::from)?;
            let Some(rel) = payload_rel_path(&entry)? else {
                continue;
            };
            let dest = mount_point.join(&rel);
            if entry.header().entry_type().is_dir() {
                fsutil::create_dir(&dest)?;
                continue;
            }
            if let Some(parent) = dest.parent() {
                fsutil::create_dir(parent)?;
            }
            entry.unpack(&dest).map_err(|e| {
                Error::General(format!("failed to unpack {}: {e}", dest.display()))
            })?;
        }

        debug!("mounted {} at {}", self.path.display(), mount_point.display());
        Ok(Box::new(BundleMount {
            root: mount_point.to_path_buf(),
            mounted: true,
        }))
    }

    fn config_document(&self) -> serde_json::Value {
        self.manifest
            .config
            .clone()
            .unwrap_or_else(|| serde_json::json!({}))
    }
}

impl BundleImage {
    fn verify_payload_digests(&self) -> Result<()> {
        let mut seen = BTreeSet::new();

        let mut archive = open_archive(&self.path)?;
        for entry in archive.entries().map_err(Error::from)? {
            let mut entry = entry.map_err(Error::from)?;
            let path = entry.path().map_err(Error::from)?.into_owned();
            let name = path.to_string_lossy().into_owned();
            if !name.starts_with(PAYLOAD_PREFIX) || !entry.header().entry_type().is_file() {
                continue;
            }

            let mut hasher = Sha256::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = entry.read(&mut buf).map_err(Error::from)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            let digest = format!("{:x}", hasher.finalize());

            match self.manifest.files.get(&name) {
                None => {
                    return Err(Error::VerificationFailed(format!(
                        "payload entry not listed in manifest: {name}"
                    )));
                }
                Some(expected) if *expected != digest => {
                    return Err(Error::VerificationFailed(format!(
                        "digest mismatch for {name}"
                    )));
                }
                Some(_) => {
                    seen.insert(name);
                }
            }
        }

        for listed in self.manifest.files.keys() {
            if !seen.contains(listed) {
                return Err(Error::VerificationFailed(format!(
                    "payload entry listed in manifest but absent: {listed}"
                )));
            }
        }
        Ok(())
    }
}

/// Mount handle for an extracted bundle payload
pub struct BundleMount {
    root: PathBuf,
    mounted: bool,
}

impl MountHandle for BundleMount {
    fn unmount(&mut self) -> Result<()> {
        if self.mounted {
            fsutil::remove_dir(&self.root)?;
            self.mounted = false;
        }
        Ok(())
    }

    fn is_mounted(&self) -> bool {
        self.mounted
    }
}

fn open_archive(path: &Path) -> Result<Archive<GzDecoder<File>>> {
    let file = File::open(path)
        .map_err(|e| Error::General(format!("failed to open bundle {}: {e}", path.display())))?;
    Ok(Archive::new(GzDecoder::new(file)))
}

/// Payload path of an entry relative to the mount point, or None for
/// control entries. Rejects anything that could escape the mount point.
fn payload_rel_path<R: Read>(entry: &tar::Entry<'_, R>) -> Result<Option<PathBuf>> {
    let path = entry.path().map_err(Error::from)?;
    let name = path.to_string_lossy();
    let Some(stripped) = name.strip_prefix(PAYLOAD_PREFIX) else {
        return Ok(None);
    };
    if stripped.is_empty() {
        return Ok(None);
    }

    let rel = PathBuf::from(stripped);
    let safe = rel
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !safe {
        return Err(Error::VerificationFailed(format!(
            "unsafe payload path in bundle: {name}"
        )));
    }
    Ok(Some(rel))
}

/// First pass over the archive: pull out manifest and signature
fn read_control_entries(path: &Path) -> Result<(Option<Vec<u8>>, Option<String>)> {
    let mut manifest = None;
    let mut signature = None;

    let mut archive = open_archive(path)?;
    for entry in archive.entries().map_err(Error::from)? {
        let mut entry = entry.map_err(Error::from)?;
        let name = entry
            .path()
            .map_err(Error::from)?
            .to_string_lossy()
            .into_owned();
        if name == MANIFEST_NAME {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).map_err(Error::from)?;
            manifest = Some(bytes);
        } else if name == SIGNATURE_NAME {
            let mut text = String::new();
            entry.read_to_string(&mut text).map_err(Error::from)?;
            signature = Some(text);
        }
    }
    Ok((manifest, signature))
}
