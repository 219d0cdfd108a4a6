// src/image/builder.rs

//! Bundle image creation
//!
//! Used by the `pack` CLI command and by tests. Digests are computed here;
//! the manifest signature is produced off-device and passed in as an opaque
//! string, so the builder never needs a private key.

use crate::error::{Error, Result};
use crate::image::bundle::{BundleManifest, MANIFEST_NAME, ManifestDependency, SIGNATURE_NAME};
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use tracing::debug;

/// Assembles a bundle image file
pub struct BundleBuilder {
    id: String,
    version: String,
    dependencies: Vec<ManifestDependency>,
    config: Option<serde_json::Value>,
    files: Vec<(String, Vec<u8>)>,
    signature: Option<String>,
}

impl BundleBuilder {
    pub fn new(id: &str, version: &str) -> Self {
        Self {
            id: id.to_string(),
            version: version.to_string(),
            dependencies: Vec::new(),
            config: None,
            files: Vec::new(),
            signature: None,
        }
    }

    /// Declare a dependency constraint
    pub fn dependency(mut self, id: &str, range: &str) -> Self {
        self.dependencies.push(ManifestDependency {
            id: id.to_string(),
            range: range.to_string(),
        });
        self
    }

    /// Embed the configuration document dumped at lock time
    pub fn config(mut self, document: serde_json::Value) -> Self {
        self.config = Some(document);
        self
    }

    /// Add one payload file at `rel` (relative to the payload root)
    pub fn file(mut self, rel: &str, contents: &[u8]) -> Self {
        self.files.push((rel.to_string(), contents.to_vec()));
        self
    }

    /// Add every regular file under `dir` as payload
    pub fn add_dir(mut self, dir: &Path) -> Result<Self> {
        collect_files(dir, "", &mut self.files)?;
        Ok(self)
    }

    /// Embed an externally produced minisign signature over the manifest
    pub fn signature(mut self, signature: &str) -> Self {
        self.signature = Some(signature.to_string());
        self
    }

    /// Write the bundle image to `dest`
    pub fn write(self, dest: &Path) -> Result<()> {
        let mut files = BTreeMap::new();
        for (rel, contents) in &self.files {
            let digest = format!("{:x}", Sha256::digest(contents));
            files.insert(format!("rootfs/{rel}"), digest);
        }

        let manifest = BundleManifest {
            id: self.id,
            version: self.version,
            dependencies: self.dependencies,
            files,
            config: self.config,
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;

        let out = File::create(dest)
            .map_err(|e| Error::General(format!("failed to create {}: {e}", dest.display())))?;
        let encoder = GzEncoder::new(out, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        append_entry(&mut builder, MANIFEST_NAME, &manifest_bytes, 0o644)?;
        if let Some(signature) = &self.signature {
            append_entry(&mut builder, SIGNATURE_NAME, signature.as_bytes(), 0o644)?;
        }
        for (rel, contents) in &self.files {
            append_entry(&mut builder, &format!("rootfs/{rel}"), contents, 0o755)?;
        }

        let encoder = builder.into_inner().map_err(Error::from)?;
        encoder.finish().map_err(Error::from)?;

        debug!("wrote bundle {}", dest.display());
        Ok(())
    }
}

fn append_entry<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
    mode: u32,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_cksum();
    builder
        .append_data(&mut header, name, data)
        .map_err(|e| Error::General(format!("failed to append {name}: {e}")))
}

fn collect_files(dir: &Path, prefix: &str, out: &mut Vec<(String, Vec<u8>)>) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::General(format!("failed to read {}: {e}", dir.display())))?;
    for entry in entries {
        let entry = entry.map_err(Error::from)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, &rel, out)?;
        } else {
            let contents = std::fs::read(&path).map_err(Error::from)?;
            out.push((rel, contents));
        }
    }
    Ok(())
}
