// src/orchestrator.rs

//! Install/uninstall orchestrator
//!
//! Serializes every mutating package-identity operation behind one task
//! mutex, stages filesystem changes with [`ScopedDir`] guards so nothing
//! survives a failed step, and converges record store and disk through the
//! maintenance pass that runs at startup and after every mutating call.
//!
//! Content and record are not written in one indivisible step; a crash
//! between them leaves an orphan that the next maintenance pass detects and
//! removes on whichever side it landed.

use crate::archive;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fsutil::{self, ScopedDir};
use crate::store::{AppDetails, NewRecord, PackageId, RecordFilter, Store};
use regex::Regex;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// How much of an app an uninstall removes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallMode {
    /// Remove the version and, once no versions remain, the shared storage
    Full,
    /// Remove only the version; shared storage survives for the next install
    Upgrade,
}

impl FromStr for UninstallMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(UninstallMode::Full),
            "upgrade" => Ok(UninstallMode::Upgrade),
            other => Err(Error::WrongParams(format!(
                "uninstall type must be 'full' or 'upgrade', got '{other}'"
            ))),
        }
    }
}

/// Disk usage report
#[derive(Debug, Clone, Default)]
pub struct StorageDetails {
    pub app_path: Option<PathBuf>,
    pub app_used_kb: Option<u64>,
    pub persistent_path: Option<PathBuf>,
    pub persistent_used_kb: Option<u64>,
}

struct Inner {
    store: Store,
    /// Top-level locked pairs; uninstall of a member is refused
    locked: Vec<(String, String)>,
}

/// The orchestrator; one instance per content root
pub struct Orchestrator {
    config: Config,
    inner: Mutex<Inner>,
}

impl Orchestrator {
    /// Create roots, open the record store, and run startup reconciliation
    pub fn open(config: Config) -> Result<Self> {
        info!("configuring orchestrator");
        fsutil::create_dir(&config.apps_path())?;
        fsutil::create_dir(&config.data_path())?;

        let mut db_dir = ScopedDir::create(&config.db_path())?;
        let store = Store::open(&config.db_file())?;
        db_dir.commit();

        let orchestrator = Self {
            config,
            inner: Mutex::new(Inner {
                store,
                locked: Vec::new(),
            }),
        };
        if let Err(e) = orchestrator.reconcile() {
            warn!("startup maintenance failed: {e}");
        }
        info!("configuration done");
        Ok(orchestrator)
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install an application archive under the given identity
    pub fn install(
        &self,
        id: &PackageId,
        locator: &std::path::Path,
        name: &str,
        category: &str,
    ) -> Result<AppDetails> {
        info!(
            "install type={} id={} version={} locator={}",
            id.pkg_type,
            id.id,
            id.version,
            locator.display()
        );

        if id.pkg_type.is_empty() || id.id.is_empty() || id.version.is_empty() {
            return Err(Error::WrongParams(
                "type, id and version are required".to_string(),
            ));
        }
        if !fsutil::is_safe_segment(&id.id) || !fsutil::is_safe_segment(&id.version) {
            return Err(Error::WrongParams(
                "id and version must be plain path segments".to_string(),
            ));
        }

        let mut inner = self.lock_inner();

        if inner.store.is_installed(&id.pkg_type, &id.id, &id.version)? {
            return Err(Error::AlreadyInstalled {
                id: id.id.clone(),
                version: id.version.clone(),
            });
        }
        if let Some(bound) = inner.store.type_of(&id.id)? {
            if bound != id.pkg_type {
                error!(
                    "id '{}' is already used with type '{bound}'; app id must be unique",
                    id.id
                );
                return Err(Error::WrongParams(format!(
                    "id '{}' is already bound to type '{bound}'",
                    id.id
                )));
            }
        }

        self.do_install(&mut inner, id, locator, name, category)
    }

    fn do_install(
        &self,
        inner: &mut Inner,
        id: &PackageId,
        locator: &std::path::Path,
        name: &str,
        category: &str,
    ) -> Result<AppDetails> {
        let app_sub = format!("{}/{}", id.id, id.version);
        let data_sub = id.id.clone();
        debug!("app sub-path: {app_sub}");

        let _scoped_tmp = ScopedDir::create(&self.config.apps_tmp_path().join(&app_sub))?;

        let content_dir = self.config.apps_path().join(&app_sub);
        let mut scoped_content = ScopedDir::create(&content_dir)?;

        debug!("unpacking {} into {}", locator.display(), content_dir.display());
        archive::extract(locator, &content_dir)?;

        let storage_dir = self.config.data_path().join(&data_sub);
        let mut scoped_storage = ScopedDir::create(&storage_dir)?;

        // content is local now, the source locator is no longer needed
        inner.store.add_record(&NewRecord {
            pkg_type: id.pkg_type.clone(),
            id: id.id.clone(),
            version: id.version.clone(),
            name: name.to_string(),
            category: category.to_string(),
            url: String::new(),
            app_path: app_sub,
            data_path: data_sub,
        })?;

        scoped_content.commit();
        scoped_storage.commit();

        self.import_annotations(inner, id, &content_dir);

        if let Err(e) = self.maintenance(inner) {
            warn!("maintenance failed: {e}");
        }

        debug!("install finished");
        Ok(AppDetails {
            pkg_type: id.pkg_type.clone(),
            id: id.id.clone(),
            version: id.version.clone(),
            name: name.to_string(),
            category: category.to_string(),
            url: String::new(),
        })
    }

    /// Best-effort import of the bundled annotations file as metadata
    fn import_annotations(&self, inner: &mut Inner, id: &PackageId, content_dir: &std::path::Path) {
        let Some(path) = self.config.annotations_path(content_dir) else {
            return;
        };
        if !path.is_file() {
            return;
        }

        info!("auto importing annotations from {}", path.display());
        let document: serde_json::Value = match std::fs::read_to_string(&path)
            .map_err(Error::from)
            .and_then(|text| serde_json::from_str(&text).map_err(Error::from))
        {
            Ok(document) => document,
            Err(e) => {
                warn!("error reading or parsing annotations: {e}");
                return;
            }
        };
        let Some(annotations) = document.get("annotations").and_then(|v| v.as_object()) else {
            return;
        };
        let pattern = match Regex::new(self.config.annotations_regex()) {
            Ok(pattern) => pattern,
            Err(e) => {
                warn!("invalid annotations regex: {e}");
                return;
            }
        };

        for (key, value) in annotations {
            if !pattern.is_match(key) {
                continue;
            }
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            debug!("importing {key} = {value} as metadata");
            if let Err(e) = inner
                .store
                .set_metadata(&id.pkg_type, &id.id, &id.version, key, &value)
            {
                warn!("unable to save metadata: {e}");
            }
        }
    }

    /// Uninstall one version, or clean up a leftover id
    ///
    /// With an empty `version` and `UninstallMode::Full`, removes the shared
    /// storage of an id whose versions were all upgrade-uninstalled; refused
    /// while any version is still installed.
    pub fn uninstall(
        &self,
        pkg_type: &str,
        id: &str,
        version: &str,
        mode: UninstallMode,
    ) -> Result<()> {
        info!("uninstall type={pkg_type} id={id} version={version} mode={mode:?}");

        let mut inner = self.lock_inner();

        let bare_cleanup =
            version.is_empty() && !pkg_type.is_empty() && !id.is_empty() && mode == UninstallMode::Full;
        if bare_cleanup {
            if inner.store.data_paths(pkg_type, id)?.is_empty() {
                return Err(Error::WrongParams(format!("no app data found for '{id}'")));
            }
            if !inner.store.content_paths(pkg_type, id, "")?.is_empty() {
                return Err(Error::WrongParams(format!(
                    "versions of '{id}' are still installed"
                )));
            }
        } else if !inner.store.is_installed(pkg_type, id, version)? {
            return Err(Error::WrongParams(format!(
                "app not installed: {id}:{version}"
            )));
        }

        let blocked = if version.is_empty() {
            inner.locked.iter().any(|(locked_id, _)| locked_id == id)
        } else {
            inner
                .locked
                .contains(&(id.to_string(), version.to_string()))
        };
        if blocked {
            error!("cannot uninstall {id}:{version} because of lock");
            return Err(Error::AppLocked {
                id: id.to_string(),
                version: version.to_string(),
            });
        }

        self.do_uninstall(&mut inner, pkg_type, id, version, mode)
    }

    fn do_uninstall(
        &self,
        inner: &mut Inner,
        pkg_type: &str,
        id: &str,
        version: &str,
        mode: UninstallMode,
    ) -> Result<()> {
        if !version.is_empty() {
            inner.store.remove_record(pkg_type, id, version)?;
            let content_dir = self.config.apps_path().join(id).join(version);
            debug!("removing {}", content_dir.display());
            fsutil::remove_dir(&content_dir)?;
        }

        if mode == UninstallMode::Full
            && inner.store.content_paths(pkg_type, id, "")?.is_empty()
        {
            inner.store.remove_all_data_for(pkg_type, id)?;
            let storage_dir = self.config.data_path().join(id);
            debug!("removing storage directory {}", storage_dir.display());
            fsutil::remove_dir(&storage_dir)?;
        }

        if let Err(e) = self.maintenance(inner) {
            warn!("maintenance failed: {e}");
        }

        debug!("uninstall finished");
        Ok(())
    }

    /// Lock an installed version and return its content path
    ///
    /// A locked pair cannot be uninstalled until unlocked. Locking an
    /// already locked pair is a no-op that returns the same path.
    pub fn lock(&self, id: &str, version: &str) -> Result<PathBuf> {
        if id.is_empty() || version.is_empty() {
            return Err(Error::WrongParams("id and version are required".to_string()));
        }
        let mut inner = self.lock_inner();

        let paths = inner.store.content_paths("", id, version)?;
        let Some(sub) = paths.first() else {
            return Err(Error::WrongParams(format!(
                "app not installed: {id}:{version}"
            )));
        };
        let content = self.config.apps_path().join(sub);

        let pair = (id.to_string(), version.to_string());
        if !inner.locked.contains(&pair) {
            inner.locked.push(pair);
        }
        info!("locked {id}:{version} at {}", content.display());
        Ok(content)
    }

    /// Release a lock taken with [`Orchestrator::lock`]
    pub fn unlock(&self, id: &str, version: &str) -> Result<()> {
        let mut inner = self.lock_inner();
        let pair = (id.to_string(), version.to_string());
        let before = inner.locked.len();
        inner.locked.retain(|locked| locked != &pair);
        if inner.locked.len() == before {
            return Err(Error::WrongParams(format!("app is not locked: {id}:{version}")));
        }
        info!("unlocked {id}:{version}");
        Ok(())
    }

    /// Content path and lock state of an installed version
    pub fn lock_info(&self, id: &str, version: &str) -> Result<(PathBuf, bool)> {
        let inner = self.lock_inner();
        let paths = inner.store.content_paths("", id, version)?;
        let Some(sub) = paths.first() else {
            return Err(Error::WrongParams(format!(
                "app not installed: {id}:{version}"
            )));
        };
        let locked = inner
            .locked
            .contains(&(id.to_string(), version.to_string()));
        Ok((self.config.apps_path().join(sub), locked))
    }

    /// Disk usage for the whole installation or one app
    pub fn storage_details(
        &self,
        pkg_type: &str,
        id: &str,
        version: &str,
    ) -> Result<StorageDetails> {
        let inner = self.lock_inner();
        let mut details = StorageDetails::default();

        if pkg_type.is_empty() && id.is_empty() && version.is_empty() {
            info!("calculating overall usage");
            details.app_path = Some(self.config.apps_path());
            details.app_used_kb = Some(fsutil::dir_space(&self.config.apps_path())? / 1024);
            details.persistent_path = Some(self.config.data_path());
            details.persistent_used_kb = Some(fsutil::dir_space(&self.config.data_path())? / 1024);
        } else if !id.is_empty() {
            info!("calculating usage for type={pkg_type} id={id} version={version}");
            if !version.is_empty() {
                let paths = inner.store.content_paths(pkg_type, id, version)?;
                if paths.is_empty() {
                    return Err(Error::WrongParams(format!(
                        "app not installed: {id}:{version}"
                    )));
                }
                let mut used = 0;
                for sub in &paths {
                    let path = self.config.apps_path().join(sub);
                    used += fsutil::dir_space(&path)?;
                    details.app_path = Some(path);
                }
                details.app_used_kb = Some(used / 1024);
            }
            let mut used = 0;
            for sub in inner.store.data_paths(pkg_type, id)? {
                let path = self.config.data_path().join(sub);
                used += fsutil::dir_space(&path)?;
                details.persistent_path = Some(path);
            }
            details.persistent_used_kb = Some(used / 1024);
        } else {
            return Err(Error::WrongParams(
                "id is required unless querying overall usage".to_string(),
            ));
        }
        Ok(details)
    }

    /// Details for a single id
    pub fn details(&self, id: &str) -> Result<AppDetails> {
        if id.is_empty() {
            return Err(Error::WrongParams("need app id to get details".to_string()));
        }
        self.lock_inner().store.details(id)
    }

    /// Filtered listing of installed apps and leftover ids
    pub fn list(&self, filter: &RecordFilter) -> Result<Vec<AppDetails>> {
        self.lock_inner().store.list(filter)
    }

    pub fn set_metadata(
        &self,
        pkg_type: &str,
        id: &str,
        version: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        if pkg_type.is_empty() || id.is_empty() || version.is_empty() || key.is_empty() {
            return Err(Error::WrongParams(
                "type, id, version and key are required".to_string(),
            ));
        }
        self.lock_inner()
            .store
            .set_metadata(pkg_type, id, version, key, value)
    }

    pub fn clear_metadata(&self, pkg_type: &str, id: &str, version: &str, key: &str) -> Result<()> {
        if pkg_type.is_empty() || id.is_empty() || version.is_empty() {
            return Err(Error::WrongParams(
                "type, id and version are required".to_string(),
            ));
        }
        self.lock_inner()
            .store
            .clear_metadata(pkg_type, id, version, key)
    }

    pub fn get_metadata(
        &self,
        pkg_type: &str,
        id: &str,
        version: &str,
    ) -> Result<(AppDetails, Vec<(String, String)>)> {
        if pkg_type.is_empty() || id.is_empty() || version.is_empty() {
            return Err(Error::WrongParams(
                "type, id and version are required".to_string(),
            ));
        }
        self.lock_inner().store.get_metadata(pkg_type, id, version)
    }

    /// Absolute path of an installed app's annotations file
    pub fn app_config_path(&self, id: &str, version: &str) -> Result<PathBuf> {
        if id.is_empty() || version.is_empty() {
            return Err(Error::WrongParams("id and version are required".to_string()));
        }
        if self.config.annotations_file().is_empty() {
            return Err(Error::WrongParams(
                "annotations file is not configured".to_string(),
            ));
        }
        let inner = self.lock_inner();
        let paths = inner.store.content_paths("", id, version)?;
        let Some(sub) = paths.first() else {
            return Err(Error::WrongParams(format!(
                "no app path found for {id}:{version}"
            )));
        };
        Ok(self
            .config
            .apps_path()
            .join(sub)
            .join(self.config.annotations_file()))
    }

    /// Run the maintenance pass: converge record store and filesystem
    pub fn reconcile(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        self.maintenance(&mut inner)
    }

    fn maintenance(&self, inner: &mut Inner) -> Result<()> {
        debug!("running maintenance");

        // recreate the scratch root empty
        fsutil::remove_dir(&self.config.apps_tmp_path())?;
        fsutil::create_dir(&self.config.apps_tmp_path())?;

        // remove content directories with no record
        let apps_root = self.config.apps_path();
        for id_dir in fsutil::subdirectories(&apps_root)? {
            // the scratch root lives inside the apps root
            if apps_root.join(&id_dir) == self.config.apps_tmp_path() {
                continue;
            }
            let id_path = apps_root.join(&id_dir);
            if fsutil::is_empty(&id_path)? {
                debug!("empty dir {}, removing", id_path.display());
                fsutil::remove_dir(&id_path)?;
                continue;
            }
            for ver_dir in fsutil::subdirectories(&id_path)? {
                let ver_path = id_path.join(&ver_dir);
                if fsutil::is_empty(&ver_path)? {
                    debug!("empty dir {}, removing", ver_path.display());
                    fsutil::remove_dir(&ver_path)?;
                    continue;
                }
                if !inner.store.is_installed("", &id_dir, &ver_dir)? {
                    warn!("{id_dir}:{ver_dir} not found in installed apps, removing dir");
                    fsutil::remove_dir(&ver_path)?;
                }
            }
        }

        // remove storage directories with no record under the id
        let data_root = self.config.data_path();
        for id_dir in fsutil::subdirectories(&data_root)? {
            if !inner.store.has_data("", &id_dir)? {
                debug!("{id_dir} not found in apps, removing storage dir");
                fsutil::remove_dir(&data_root.join(&id_dir))?;
            }
        }

        // drop records whose content is gone, recreate missing storage dirs
        for details in inner.store.list(&RecordFilter::default())? {
            if !details.version.is_empty() {
                for sub in
                    inner
                        .store
                        .content_paths(&details.pkg_type, &details.id, &details.version)?
                {
                    let content = apps_root.join(&sub);
                    let no_files = if fsutil::dir_exists(&content) {
                        fsutil::is_empty(&content)?
                    } else {
                        true
                    };
                    if no_files {
                        warn!(
                            "record {}:{} has no content, removing record",
                            details.id, details.version
                        );
                        inner.store.remove_record(
                            &details.pkg_type,
                            &details.id,
                            &details.version,
                        )?;
                    }
                }
            }
            for sub in inner.store.data_paths(&details.pkg_type, &details.id)? {
                let data = data_root.join(&sub);
                if !fsutil::dir_exists(&data) {
                    fsutil::create_dir(&data)?;
                }
            }
        }

        Ok(())
    }
}
