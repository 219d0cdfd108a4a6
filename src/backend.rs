// src/backend.rs

//! Package backend capability interface
//!
//! One polymorphic surface over two very different content models, selected
//! at construction:
//!
//! - [`StoreBackend`] — archives extracted onto disk, identities persisted
//!   in the record store, plain path-based locking
//! - [`ImageBackend`] — signed bundle images, dependency-aware
//!   reference-counted mounting through the lock engine

use crate::config::Config;
use crate::engine::{self, IMAGE_FILE_NAME, LockEngine, LockManifestEntry};
use crate::error::{Error, Result};
use crate::fsutil::{self, ScopedDir};
use crate::image::{BundleOpener, ImageOpener, OpenMode};
use crate::orchestrator::{Orchestrator, UninstallMode};
use crate::store::{AppDetails, PackageId, RecordFilter};
use crate::trust::VerificationBundle;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

/// Free-form name/value pairs passed alongside install requests
pub type NameValues = [(String, String)];

/// Result of a successful lock
#[derive(Debug, Clone)]
pub struct Lease {
    /// Where the package content is available for execution
    pub content_path: PathBuf,
    /// Lock manifest file, when the backend produces one
    pub manifest_path: Option<PathBuf>,
    /// Manifest rows in mount order
    pub entries: Vec<LockManifestEntry>,
}

/// Identity read back from a package file
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub id: String,
    pub version: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LockStatus {
    pub path: PathBuf,
    pub locked: bool,
}

/// The public operation surface shared by both backends
pub trait PackageBackend: Send + Sync {
    fn install(
        &self,
        id: &str,
        version: &str,
        metadata: &NameValues,
        locator: &Path,
    ) -> Result<()>;

    /// Remove the app behind `id` entirely
    fn uninstall(&self, id: &str) -> Result<()>;

    fn lock(&self, id: &str, version: &str) -> Result<Lease>;

    fn unlock(&self, id: &str, version: &str) -> Result<()>;

    fn lock_info(&self, id: &str, version: &str) -> Result<LockStatus>;

    fn installed(&self) -> Result<Vec<AppDetails>>;

    fn file_metadata(&self, locator: &Path) -> Result<FileMetadata>;
}

/// Which backend variant to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Store,
    Image,
    /// Legacy mode: signature checks skipped; must be requested explicitly
    ImageUnverified,
}

/// Construct a backend for the given kind
pub fn open(config: Config, kind: BackendKind) -> Result<Box<dyn PackageBackend>> {
    match kind {
        BackendKind::Store => Ok(Box::new(StoreBackend::open(config)?)),
        BackendKind::Image => Ok(Box::new(ImageBackend::open(&config)?)),
        BackendKind::ImageUnverified => Ok(Box::new(ImageBackend::open_unverified(&config)?)),
    }
}

fn metadata_value(metadata: &NameValues, key: &str) -> String {
    metadata
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
        .unwrap_or_default()
}

/// Archive + record-store backend
pub struct StoreBackend {
    orchestrator: Orchestrator,
}

impl StoreBackend {
    pub fn open(config: Config) -> Result<Self> {
        Ok(Self {
            orchestrator: Orchestrator::open(config)?,
        })
    }

    /// The full orchestrator surface behind this backend
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }
}

impl PackageBackend for StoreBackend {
    fn install(
        &self,
        id: &str,
        version: &str,
        metadata: &NameValues,
        locator: &Path,
    ) -> Result<()> {
        let pkg_type = metadata_value(metadata, "type");
        let name = metadata_value(metadata, "appName");
        let category = metadata_value(metadata, "category");

        self.orchestrator
            .install(&PackageId::new(&pkg_type, id, version), locator, &name, &category)?;
        Ok(())
    }

    fn uninstall(&self, id: &str) -> Result<()> {
        let details = self.orchestrator.details(id)?;
        self.orchestrator
            .uninstall(&details.pkg_type, id, &details.version, UninstallMode::Full)
    }

    fn lock(&self, id: &str, version: &str) -> Result<Lease> {
        let content_path = self.orchestrator.lock(id, version)?;
        Ok(Lease {
            content_path,
            manifest_path: None,
            entries: Vec::new(),
        })
    }

    fn unlock(&self, id: &str, version: &str) -> Result<()> {
        self.orchestrator.unlock(id, version)
    }

    fn lock_info(&self, id: &str, version: &str) -> Result<LockStatus> {
        let (path, locked) = self.orchestrator.lock_info(id, version)?;
        Ok(LockStatus { path, locked })
    }

    fn installed(&self) -> Result<Vec<AppDetails>> {
        self.orchestrator.list(&RecordFilter::default())
    }

    fn file_metadata(&self, _locator: &Path) -> Result<FileMetadata> {
        // plain archives carry no manifest to read an identity from
        Err(Error::WrongParams(
            "file metadata is not available for archive packages".to_string(),
        ))
    }
}

/// Signed-image backend with dependency-aware mounting
pub struct ImageBackend {
    opener: Arc<dyn ImageOpener>,
    engine: LockEngine,
    images_root: PathBuf,
    /// Installed `(id, version)` pairs; rebuilt from disk at startup
    index: Mutex<Vec<(String, String)>>,
}

impl ImageBackend {
    /// Verified mode: trust anchors are required and every package must
    /// carry a valid signature
    pub fn open(config: &Config) -> Result<Self> {
        let trust = VerificationBundle::load(&config.certs_path())?;
        info!("initialized verification bundle with {} anchors", trust.len());
        Self::open_with(config, BundleOpener::new(trust, OpenMode::Verified))
    }

    /// Legacy mode: signature checks skipped; payload digests still apply
    pub fn open_unverified(config: &Config) -> Result<Self> {
        warn!("package signature verification is disabled");
        Self::open_with(
            config,
            BundleOpener::new(VerificationBundle::empty(), OpenMode::Unverified),
        )
    }

    fn open_with(config: &Config, opener: BundleOpener) -> Result<Self> {
        let opener: Arc<dyn ImageOpener> = Arc::new(opener);
        let images_root = config.images_path();
        fsutil::create_dir(&images_root)?;
        fsutil::create_dir(&config.mounts_path())?;

        let index = scan_images(&images_root)?;
        info!("found {} installed packages", index.len());

        let engine = LockEngine::new(Arc::clone(&opener), &images_root, &config.mounts_path());
        Ok(Self {
            opener,
            engine,
            images_root,
            index: Mutex::new(index),
        })
    }

    /// The lock/mount engine behind this backend
    pub fn engine(&self) -> &LockEngine {
        &self.engine
    }

    fn lock_index(&self) -> MutexGuard<'_, Vec<(String, String)>> {
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Rebuild the installed index from `<root>/<id>/<version>/package.img`
fn scan_images(root: &Path) -> Result<Vec<(String, String)>> {
    let mut index = Vec::new();
    for id in fsutil::subdirectories(root)? {
        for version in fsutil::subdirectories(&root.join(&id))? {
            if root.join(&id).join(&version).join(IMAGE_FILE_NAME).is_file() {
                index.push((id.clone(), version));
            }
        }
    }
    Ok(index)
}

impl PackageBackend for ImageBackend {
    fn install(
        &self,
        id: &str,
        version: &str,
        _metadata: &NameValues,
        locator: &Path,
    ) -> Result<()> {
        let package = self.opener.open(locator)?;
        package.verify()?;

        // the image's own manifest is authoritative for its identity
        let matches_caller = (id.is_empty() || id == package.id())
            && (version.is_empty() || version == package.version());
        if !matches_caller {
            return Err(Error::VersionMismatch {
                expected: format!("{id}:{version}"),
                found: format!("{}:{}", package.id(), package.version()),
            });
        }
        let id = package.id().to_string();
        let version = package.version().to_string();

        let mut index = self.lock_index();
        if index.contains(&(id.clone(), version.clone())) {
            return Err(Error::AlreadyInstalled { id, version });
        }
        for dep in package.dependencies() {
            engine::resolve(&index, dep)?;
        }

        let dir = self.images_root.join(&id).join(&version);
        let mut scoped = ScopedDir::create(&dir)?;
        std::fs::copy(locator, dir.join(IMAGE_FILE_NAME)).map_err(|e| {
            Error::General(format!("failed to copy package into {}: {e}", dir.display()))
        })?;
        scoped.commit();

        index.push((id.clone(), version.clone()));
        info!("installed package image {id}:{version}");
        Ok(())
    }

    fn uninstall(&self, id: &str) -> Result<()> {
        let mut index = self.lock_index();
        if !index.iter().any(|(installed_id, _)| installed_id == id) {
            return Err(Error::WrongParams(format!("package not installed: {id}")));
        }
        if self.engine.is_any_version_locked(id) {
            return Err(Error::AppLocked {
                id: id.to_string(),
                version: String::new(),
            });
        }

        fsutil::remove_dir(&self.images_root.join(id))?;
        index.retain(|(installed_id, _)| installed_id != id);
        info!("uninstalled package {id}");
        Ok(())
    }

    fn lock(&self, id: &str, version: &str) -> Result<Lease> {
        let snapshot = self.lock_index().clone();
        let info = self.engine.lock(id, version, &snapshot)?;
        Ok(Lease {
            content_path: info.mount_point,
            manifest_path: Some(info.manifest_path),
            entries: info.entries,
        })
    }

    fn unlock(&self, id: &str, version: &str) -> Result<()> {
        let snapshot = self.lock_index().clone();
        self.engine.unlock(id, version, &snapshot)
    }

    fn lock_info(&self, id: &str, version: &str) -> Result<LockStatus> {
        if let Some(path) = self.engine.mount_point(id, version) {
            return Ok(LockStatus {
                path,
                locked: self.engine.is_locked(id, version),
            });
        }
        let dir = self.images_root.join(id).join(version);
        if dir.join(IMAGE_FILE_NAME).is_file() {
            Ok(LockStatus {
                path: dir,
                locked: false,
            })
        } else {
            Err(Error::WrongParams(format!(
                "package not installed: {id}:{version}"
            )))
        }
    }

    fn installed(&self) -> Result<Vec<AppDetails>> {
        Ok(self
            .lock_index()
            .iter()
            .map(|(id, version)| AppDetails {
                id: id.clone(),
                version: version.clone(),
                ..AppDetails::default()
            })
            .collect())
    }

    fn file_metadata(&self, locator: &Path) -> Result<FileMetadata> {
        let package = self.opener.open(locator)?;
        package.verify()?;
        Ok(FileMetadata {
            id: package.id().to_string(),
            version: package.version().to_string(),
            path: locator.to_path_buf(),
        })
    }
}
