// src/archive.rs

//! Application archive extraction
//!
//! Install sources are gzip-compressed tarballs already present on local
//! storage. Extraction goes through the `tar` crate, which refuses entries
//! that would escape the destination directory.

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::path::Path;
use tar::Archive;
use tracing::debug;

/// Unpack `archive` into `dest`
///
/// `dest` must already exist; entry permissions are preserved.
pub fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive)
        .map_err(|e| Error::General(format!("failed to open archive {}: {e}", archive.display())))?;

    let mut tar = Archive::new(GzDecoder::new(file));
    tar.set_preserve_permissions(true);
    tar.unpack(dest).map_err(|e| {
        Error::General(format!(
            "failed to extract {} into {}: {e}",
            archive.display(),
            dest.display()
        ))
    })?;

    debug!("extracted {} into {}", archive.display(), dest.display());
    Ok(())
}
