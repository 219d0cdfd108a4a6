// src/engine.rs

//! Dependency-aware lock/mount engine
//!
//! Locking a package mounts it and its transitive dependencies, sharing one
//! reference-counted mount per `(id, version)` key across every locker.
//! Unlocking mirrors the walk and releases each mount when its count reaches
//! zero.
//!
//! The mount table is guarded by its own mutex, separate from the
//! install/uninstall serialization. The guard is taken once per top-level
//! Lock or Unlock and threaded through the recursion as `&mut MountTable`,
//! so every function that can mutate the table says so in its signature.
//! The installed index is snapshotted by the caller before the guard is
//! taken; nothing here may acquire other locks while holding it.

use crate::error::{Error, Result};
use crate::fsutil;
use crate::image::{ImageDependency, ImageOpener, MountHandle, PackageImage};
use crate::version;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// File name of an installed package image under `<images>/<id>/<version>/`
pub const IMAGE_FILE_NAME: &str = "package.img";

/// File name of the config document dumped next to a mount point
pub const CONFIG_DUMP_NAME: &str = "config.json";

/// One mounted package in a lock manifest
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LockManifestEntry {
    #[serde(rename = "pkgMountPath")]
    pub mount_path: String,
    #[serde(rename = "pkgMetaDataPath")]
    pub metadata_path: String,
}

#[derive(Serialize)]
struct LockManifestFile<'a> {
    packages: &'a [LockManifestEntry],
}

/// Result of a successful lock
#[derive(Debug, Clone)]
pub struct LockInfo {
    /// Mount point of the requested package itself
    pub mount_point: PathBuf,
    /// Manifest file listing every package mounted for this lock
    pub manifest_path: PathBuf,
    /// Manifest rows in mount order, dependencies before dependents
    pub entries: Vec<LockManifestEntry>,
}

struct MountedPackageInfo {
    ref_count: u32,
    mount_point: PathBuf,
    metadata_path: PathBuf,
    handle: Box<dyn MountHandle>,
}

/// Process-wide mount state; only reachable through the engine's guard
#[derive(Default)]
struct MountTable {
    entries: HashMap<String, MountedPackageInfo>,
    /// Top-level locked pairs, independent of mount refcounts
    locked: BTreeSet<(String, String)>,
}

/// The engine itself; one instance per image root
pub struct LockEngine {
    opener: Arc<dyn ImageOpener>,
    images_root: PathBuf,
    mounts_root: PathBuf,
    table: Mutex<MountTable>,
}

fn mount_key(id: &str, version: &str) -> String {
    format!("{id}_{version}")
}

fn manifest_entry(info: &MountedPackageInfo) -> LockManifestEntry {
    LockManifestEntry {
        mount_path: info.mount_point.to_string_lossy().into_owned(),
        metadata_path: info.metadata_path.to_string_lossy().into_owned(),
    }
}

/// First installed version of `dep.id` satisfying the declared range
pub(crate) fn resolve(installed: &[(String, String)], dep: &ImageDependency) -> Result<String> {
    let unresolved = || Error::DependencyUnresolved {
        id: dep.id.clone(),
        range: dep.range.clone(),
    };
    let range = version::parse_range(&dep.range).map_err(|_| unresolved())?;

    for (id, installed_version) in installed {
        if id == &dep.id && version::satisfies(&range, installed_version) {
            return Ok(installed_version.clone());
        }
    }
    Err(unresolved())
}

impl LockEngine {
    pub fn new(opener: Arc<dyn ImageOpener>, images_root: &Path, mounts_root: &Path) -> Self {
        Self {
            opener,
            images_root: images_root.to_path_buf(),
            mounts_root: mounts_root.to_path_buf(),
            table: Mutex::new(MountTable::default()),
        }
    }

    /// Installed image file path for an `(id, version)` pair
    pub fn image_file(&self, id: &str, version: &str) -> PathBuf {
        self.images_root.join(id).join(version).join(IMAGE_FILE_NAME)
    }

    fn lock_table(&self) -> MutexGuard<'_, MountTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lock `(id, version)`: mount it and its dependency closure
    ///
    /// `installed` is a snapshot of the installed `(id, version)` index taken
    /// by the caller before any engine state is touched.
    pub fn lock(
        &self,
        id: &str,
        version: &str,
        installed: &[(String, String)],
    ) -> Result<LockInfo> {
        info!("locking {id}:{version}");
        let package = self.opener.open(&self.image_file(id, version))?;

        let mut table = self.lock_table();
        let mut entries = Vec::new();
        let mut in_flight = Vec::new();
        self.lock_package(
            &mut table,
            installed,
            &mut in_flight,
            package.as_ref(),
            &mut entries,
        )?;

        let key = mount_key(id, version);
        let manifest_path = self.mounts_root.join(format!("{key}_manifest.json"));
        if let Err(e) = write_manifest(&manifest_path, &entries) {
            if let Err(rollback) =
                self.unlock_package(&mut table, installed, package.as_ref(), &mut Vec::new())
            {
                warn!("rollback unlock failed for {key}: {rollback}");
            }
            return Err(e);
        }

        let mount_point = match table.entries.get(&key) {
            Some(info) => info.mount_point.clone(),
            None => return Err(Error::General(format!("mount entry vanished for {key}"))),
        };
        table
            .locked
            .insert((id.to_string(), version.to_string()));

        Ok(LockInfo {
            mount_point,
            manifest_path,
            entries,
        })
    }

    /// Unlock `(id, version)`: mirror of [`LockEngine::lock`]
    ///
    /// Dependency unlock failures are logged and skipped; only a problem
    /// with the package's own mount entry fails the call.
    pub fn unlock(&self, id: &str, version: &str, installed: &[(String, String)]) -> Result<()> {
        info!("unlocking {id}:{version}");
        let package = self.opener.open(&self.image_file(id, version))?;

        let mut table = self.lock_table();
        self.unlock_package(&mut table, installed, package.as_ref(), &mut Vec::new())?;
        table
            .locked
            .remove(&(id.to_string(), version.to_string()));
        Ok(())
    }

    /// Current reference count for a mount key; 0 if not mounted
    pub fn mount_count(&self, id: &str, version: &str) -> u32 {
        self.lock_table()
            .entries
            .get(&mount_key(id, version))
            .map(|info| info.ref_count)
            .unwrap_or(0)
    }

    /// Number of distinct mounted packages
    pub fn mounted_packages(&self) -> usize {
        self.lock_table().entries.len()
    }

    /// True if `(id, version)` holds a top-level lock
    pub fn is_locked(&self, id: &str, version: &str) -> bool {
        self.lock_table()
            .locked
            .contains(&(id.to_string(), version.to_string()))
    }

    /// True if any version of `id` holds a top-level lock
    pub fn is_any_version_locked(&self, id: &str) -> bool {
        self.lock_table()
            .locked
            .iter()
            .any(|(locked_id, _)| locked_id == id)
    }

    /// Mount point of a currently mounted pair
    pub fn mount_point(&self, id: &str, version: &str) -> Option<PathBuf> {
        self.lock_table()
            .entries
            .get(&mount_key(id, version))
            .map(|info| info.mount_point.clone())
    }

    fn lock_package(
        &self,
        table: &mut MountTable,
        installed: &[(String, String)],
        in_flight: &mut Vec<String>,
        package: &dyn PackageImage,
        out: &mut Vec<LockManifestEntry>,
    ) -> Result<()> {
        package.verify()?;

        let key = mount_key(package.id(), package.version());
        if let Some(info) = table.entries.get_mut(&key) {
            info.ref_count += 1;
            debug!("{key} already mounted, ref_count now {}", info.ref_count);
            out.push(manifest_entry(info));
            return Ok(());
        }

        if in_flight.contains(&key) {
            return Err(Error::General(format!("dependency cycle detected at {key}")));
        }
        in_flight.push(key.clone());
        let result = self.mount_with_dependencies(table, installed, in_flight, package, out, &key);
        in_flight.pop();
        result
    }

    fn mount_with_dependencies(
        &self,
        table: &mut MountTable,
        installed: &[(String, String)],
        in_flight: &mut Vec<String>,
        package: &dyn PackageImage,
        out: &mut Vec<LockManifestEntry>,
        key: &str,
    ) -> Result<()> {
        let dependencies = package.dependencies().to_vec();
        let mut locked_here: Vec<Box<dyn PackageImage>> = Vec::new();

        for dep in &dependencies {
            let step = (|| {
                let dep_version = resolve(installed, dep)?;
                let dep_package = self
                    .opener
                    .open(&self.image_file(&dep.id, &dep_version))?;
                self.lock_package(table, installed, in_flight, dep_package.as_ref(), out)?;
                Ok(dep_package)
            })();
            match step {
                Ok(dep_package) => locked_here.push(dep_package),
                Err(e) => {
                    self.unwind(table, installed, &mut locked_here);
                    return Err(e);
                }
            }
        }

        let mounted = (|| {
            let mount_dir = self.mounts_root.join(key);
            let mount_point = mount_dir.join("rootfs");
            fsutil::create_dir(&mount_point)?;
            let handle = package.mount(&mount_point)?;

            // dump-once: an existing config dump is reused as-is
            let metadata_path = mount_dir.join(CONFIG_DUMP_NAME);
            if !metadata_path.exists() {
                let document = package.config_document();
                std::fs::write(&metadata_path, serde_json::to_vec_pretty(&document)?)
                    .map_err(Error::from)?;
            }

            Ok(MountedPackageInfo {
                ref_count: 1,
                mount_point,
                metadata_path,
                handle,
            })
        })();

        match mounted {
            Ok(info) => {
                debug!("mounted {key} at {}", info.mount_point.display());
                out.push(manifest_entry(&info));
                table.entries.insert(key.to_string(), info);
                Ok(())
            }
            Err(e) => {
                self.unwind(table, installed, &mut locked_here);
                Err(e)
            }
        }
    }

    /// Undo the dependency locks taken during one failed call, newest first
    fn unwind(
        &self,
        table: &mut MountTable,
        installed: &[(String, String)],
        locked_here: &mut Vec<Box<dyn PackageImage>>,
    ) {
        while let Some(package) = locked_here.pop() {
            if let Err(e) =
                self.unlock_package(table, installed, package.as_ref(), &mut Vec::new())
            {
                warn!(
                    "rollback unlock failed for {}:{}: {e}",
                    package.id(),
                    package.version()
                );
            }
        }
    }

    fn unlock_package(
        &self,
        table: &mut MountTable,
        installed: &[(String, String)],
        package: &dyn PackageImage,
        in_flight: &mut Vec<String>,
    ) -> Result<()> {
        let key = mount_key(package.id(), package.version());
        if in_flight.contains(&key) {
            warn!("dependency cycle detected at {key} while unlocking, skipping");
            return Ok(());
        }
        in_flight.push(key.clone());

        // best-effort: a failing dependency never aborts the walk
        for dep in package.dependencies() {
            match resolve(installed, dep) {
                Ok(dep_version) => {
                    match self.opener.open(&self.image_file(&dep.id, &dep_version)) {
                        Ok(dep_package) => {
                            if let Err(e) = self.unlock_package(
                                table,
                                installed,
                                dep_package.as_ref(),
                                in_flight,
                            ) {
                                warn!("failed to unlock dependency {}:{dep_version}: {e}", dep.id);
                            }
                        }
                        Err(e) => {
                            warn!("failed to open dependency {}:{dep_version}: {e}", dep.id);
                        }
                    }
                }
                Err(e) => warn!("failed to resolve dependency '{}': {e}", dep.id),
            }
        }
        in_flight.pop();

        let Some(info) = table.entries.get_mut(&key) else {
            return Err(Error::General(format!("package is not mounted: {key}")));
        };
        info.ref_count -= 1;
        debug!("{key} ref_count now {}", info.ref_count);

        if info.ref_count == 0 {
            if let Some(mut info) = table.entries.remove(&key) {
                if let Err(e) = info.handle.unmount() {
                    warn!("failed to release mount for {key}: {e}");
                }
                info!("released mount for {key}");
            }
        }
        Ok(())
    }
}

fn write_manifest(path: &Path, entries: &[LockManifestEntry]) -> Result<()> {
    let contents = serde_json::to_vec_pretty(&LockManifestFile { packages: entries })?;
    std::fs::write(path, contents)
        .map_err(|e| Error::General(format!("failed to write manifest {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{BundleBuilder, BundleOpener, OpenMode};
    use crate::trust::VerificationBundle;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _root: TempDir,
        engine: LockEngine,
        installed: Vec<(String, String)>,
        mounts_root: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempdir().unwrap();
            let images_root = root.path().join("images");
            let mounts_root = root.path().join("mounts");
            fsutil::create_dir(&images_root).unwrap();
            fsutil::create_dir(&mounts_root).unwrap();

            let opener = Arc::new(BundleOpener::new(
                VerificationBundle::empty(),
                OpenMode::Unverified,
            ));
            let engine = LockEngine::new(opener, &images_root, &mounts_root);
            Self {
                _root: root,
                engine,
                installed: Vec::new(),
                mounts_root,
            }
        }

        fn install(&mut self, builder: BundleBuilder, id: &str, version: &str) {
            let image = self.engine.image_file(id, version);
            fsutil::create_dir(image.parent().unwrap()).unwrap();
            builder.write(&image).unwrap();
            self.installed.push((id.to_string(), version.to_string()));
        }
    }

    #[test]
    fn test_refcount_law() {
        let mut fx = Fixture::new();
        fx.install(BundleBuilder::new("app", "1.0").file("bin/app", b"x"), "app", "1.0");

        for n in 1..=3u32 {
            fx.engine.lock("app", "1.0", &fx.installed).unwrap();
            assert_eq!(fx.engine.mount_count("app", "1.0"), n);
        }

        let mount_point = fx.engine.mount_point("app", "1.0").unwrap();
        assert!(mount_point.join("bin/app").exists());

        for n in (0..3u32).rev() {
            fx.engine.unlock("app", "1.0", &fx.installed).unwrap();
            assert_eq!(fx.engine.mount_count("app", "1.0"), n);
        }

        assert_eq!(fx.engine.mounted_packages(), 0);
        // the underlying mount was released
        assert!(!mount_point.exists());
    }

    #[test]
    fn test_lock_mounts_dependencies_first() {
        let mut fx = Fixture::new();
        fx.install(BundleBuilder::new("lib.b", "1.2").file("lib/b.so", b"b"), "lib.b", "1.2");
        fx.install(
            BundleBuilder::new("app.a", "1.0")
                .dependency("lib.b", ">=1.0")
                .file("bin/a", b"a"),
            "app.a",
            "1.0",
        );

        let info = fx.engine.lock("app.a", "1.0", &fx.installed).unwrap();
        assert_eq!(info.entries.len(), 2);
        assert!(info.entries[0].mount_path.contains("lib.b_1.2"));
        assert!(info.entries[1].mount_path.contains("app.a_1.0"));
        assert_eq!(fx.engine.mount_count("lib.b", "1.2"), 1);
        assert_eq!(fx.engine.mount_count("app.a", "1.0"), 1);

        // manifest file matches the returned entries
        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&info.manifest_path).unwrap()).unwrap();
        assert_eq!(written["packages"].as_array().unwrap().len(), 2);
        assert!(
            written["packages"][0]["pkgMountPath"]
                .as_str()
                .unwrap()
                .contains("lib.b_1.2")
        );
        assert!(
            written["packages"][1]["pkgMetaDataPath"]
                .as_str()
                .unwrap()
                .ends_with(CONFIG_DUMP_NAME)
        );
    }

    #[test]
    fn test_second_lock_takes_fast_path() {
        let mut fx = Fixture::new();
        fx.install(BundleBuilder::new("lib.b", "1.2"), "lib.b", "1.2");
        fx.install(
            BundleBuilder::new("app.a", "1.0").dependency("lib.b", ">=1.0"),
            "app.a",
            "1.0",
        );

        fx.engine.lock("app.a", "1.0", &fx.installed).unwrap();
        let second = fx.engine.lock("app.a", "1.0", &fx.installed).unwrap();

        // fast path: single manifest entry, dependency refcount untouched
        assert_eq!(second.entries.len(), 1);
        assert_eq!(fx.engine.mount_count("app.a", "1.0"), 2);
        assert_eq!(fx.engine.mount_count("lib.b", "1.2"), 1);
    }

    #[test]
    fn test_unresolved_dependency_leaves_table_unchanged() {
        let mut fx = Fixture::new();
        fx.install(
            BundleBuilder::new("app.a", "1.0").dependency("lib.missing", ">=1.0"),
            "app.a",
            "1.0",
        );

        let err = fx.engine.lock("app.a", "1.0", &fx.installed).unwrap_err();
        assert!(matches!(err, Error::DependencyUnresolved { .. }));
        assert_eq!(fx.engine.mounted_packages(), 0);
        assert!(!fx.engine.is_locked("app.a", "1.0"));
    }

    #[test]
    fn test_partial_failure_unwinds_dependencies() {
        let mut fx = Fixture::new();
        fx.install(BundleBuilder::new("lib.b", "1.0").file("lib/b", b"b"), "lib.b", "1.0");
        // lib.c is declared but never installed
        fx.install(
            BundleBuilder::new("app.a", "1.0")
                .dependency("lib.b", ">=1.0")
                .dependency("lib.c", ">=1.0"),
            "app.a",
            "1.0",
        );

        let err = fx.engine.lock("app.a", "1.0", &fx.installed).unwrap_err();
        assert!(matches!(err, Error::DependencyUnresolved { .. }));

        // lib.b was locked during the call and must be rolled back
        assert_eq!(fx.engine.mount_count("lib.b", "1.0"), 0);
        assert_eq!(fx.engine.mounted_packages(), 0);
        assert!(!fx.mounts_root.join("lib.b_1.0/rootfs").exists());
    }

    #[test]
    fn test_unwind_preserves_preexisting_refcounts() {
        let mut fx = Fixture::new();
        fx.install(BundleBuilder::new("lib.b", "1.0"), "lib.b", "1.0");
        fx.install(
            BundleBuilder::new("app.a", "1.0")
                .dependency("lib.b", ">=1.0")
                .dependency("lib.c", ">=1.0"),
            "app.a",
            "1.0",
        );

        // lib.b locked independently before the failing call
        fx.engine.lock("lib.b", "1.0", &fx.installed).unwrap();
        assert!(fx.engine.lock("app.a", "1.0", &fx.installed).is_err());

        // refcounts returned to their pre-call state, not to zero
        assert_eq!(fx.engine.mount_count("lib.b", "1.0"), 1);
        assert!(fx.engine.is_locked("lib.b", "1.0"));
    }

    #[test]
    fn test_dependency_cycle_fails_cleanly() {
        let mut fx = Fixture::new();
        fx.install(
            BundleBuilder::new("app.a", "1.0").dependency("app.b", ">=1.0"),
            "app.a",
            "1.0",
        );
        fx.install(
            BundleBuilder::new("app.b", "1.0").dependency("app.a", ">=1.0"),
            "app.b",
            "1.0",
        );

        let err = fx.engine.lock("app.a", "1.0", &fx.installed).unwrap_err();
        assert!(matches!(err, Error::General(_)));
        assert_eq!(fx.engine.mounted_packages(), 0);
    }

    #[test]
    fn test_shared_dependency_counts_both_dependents() {
        let mut fx = Fixture::new();
        fx.install(BundleBuilder::new("lib.b", "1.0"), "lib.b", "1.0");
        fx.install(
            BundleBuilder::new("app.a", "1.0").dependency("lib.b", ">=1.0"),
            "app.a",
            "1.0",
        );
        fx.install(
            BundleBuilder::new("app.c", "1.0").dependency("lib.b", ">=1.0"),
            "app.c",
            "1.0",
        );

        fx.engine.lock("app.a", "1.0", &fx.installed).unwrap();
        fx.engine.lock("app.c", "1.0", &fx.installed).unwrap();
        assert_eq!(fx.engine.mount_count("lib.b", "1.0"), 2);

        fx.engine.unlock("app.a", "1.0", &fx.installed).unwrap();
        // still required by app.c
        assert_eq!(fx.engine.mount_count("lib.b", "1.0"), 1);

        fx.engine.unlock("app.c", "1.0", &fx.installed).unwrap();
        assert_eq!(fx.engine.mounted_packages(), 0);
    }

    #[test]
    fn test_first_fit_resolution() {
        let mut fx = Fixture::new();
        // both versions satisfy the range; the first installed entry wins
        fx.install(BundleBuilder::new("lib.b", "1.0"), "lib.b", "1.0");
        fx.install(BundleBuilder::new("lib.b", "2.0"), "lib.b", "2.0");
        fx.install(
            BundleBuilder::new("app.a", "1.0").dependency("lib.b", ">=1.0"),
            "app.a",
            "1.0",
        );

        fx.engine.lock("app.a", "1.0", &fx.installed).unwrap();
        assert_eq!(fx.engine.mount_count("lib.b", "1.0"), 1);
        assert_eq!(fx.engine.mount_count("lib.b", "2.0"), 0);
    }

    #[test]
    fn test_unlock_unmounted_package_fails() {
        let mut fx = Fixture::new();
        fx.install(BundleBuilder::new("app", "1.0"), "app", "1.0");

        let err = fx.engine.unlock("app", "1.0", &fx.installed).unwrap_err();
        assert!(matches!(err, Error::General(_)));
    }

    #[test]
    fn test_config_dump_written_once() {
        let mut fx = Fixture::new();
        fx.install(
            BundleBuilder::new("app", "1.0").config(serde_json::json!({"k": "v1"})),
            "app",
            "1.0",
        );

        fx.engine.lock("app", "1.0", &fx.installed).unwrap();
        let dump = fx.mounts_root.join("app_1.0").join(CONFIG_DUMP_NAME);
        let first: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&dump).unwrap()).unwrap();
        assert_eq!(first["k"], "v1");
        fx.engine.unlock("app", "1.0", &fx.installed).unwrap();

        // replace the image content; the stale dump is knowingly reused
        let image = fx.engine.image_file("app", "1.0");
        BundleBuilder::new("app", "1.0")
            .config(serde_json::json!({"k": "v2"}))
            .write(&image)
            .unwrap();

        fx.engine.lock("app", "1.0", &fx.installed).unwrap();
        let second: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&dump).unwrap()).unwrap();
        assert_eq!(second["k"], "v1");
    }
}
