// src/image/mod.rs

//! Package-image backend interface
//!
//! The lock/mount engine only ever talks to these traits. The shipped
//! implementation is the bundle image in [`bundle`]; a block-device image
//! backed by loop mounts plugs in behind the same seam.

pub mod builder;
pub mod bundle;

pub use builder::BundleBuilder;
pub use bundle::{BundleManifest, BundleOpener, ManifestDependency};

use crate::error::Result;
use std::path::Path;

/// How packages are opened: signature checks are mandatory unless the
/// legacy unverified mode was explicitly selected at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Verified,
    Unverified,
}

/// A dependency declared in a package's own metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDependency {
    pub id: String,
    pub range: String,
}

/// An opened package image
pub trait PackageImage: Send + std::fmt::Debug {
    fn id(&self) -> &str;

    fn version(&self) -> &str;

    /// Declared dependency constraints, read fresh at open time
    fn dependencies(&self) -> &[ImageDependency];

    /// Check payload integrity and, in verified mode, authenticity
    fn verify(&self) -> Result<()>;

    /// Make the package content available at `mount_point`
    fn mount(&self, mount_point: &Path) -> Result<Box<dyn MountHandle>>;

    /// The embedded configuration document dumped next to the mount point
    fn config_document(&self) -> serde_json::Value;
}

/// Handle over an active mount
pub trait MountHandle: Send {
    fn unmount(&mut self) -> Result<()>;

    fn is_mounted(&self) -> bool;
}

/// Opens package images from installed paths
pub trait ImageOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn PackageImage>>;
}
