// tests/integration_test.rs

//! Integration tests for Berth
//!
//! These tests verify end-to-end functionality across modules, driving the
//! public backend surface the way a platform client would.

use berth::backend::{self, BackendKind, ImageBackend, PackageBackend, StoreBackend};
use berth::image::BundleBuilder;
use berth::orchestrator::UninstallMode;
use berth::store::RecordFilter;
use berth::{Config, Error};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use tempfile::{TempDir, tempdir};

fn test_config(root: &Path) -> Config {
    Config::from_json(&format!(
        r#"{{
            "appspath": "{base}/apps",
            "dbpath": "{base}/db",
            "datapath": "{base}/data",
            "imagespath": "{base}/images",
            "mountspath": "{base}/mounts",
            "certspath": "{base}/certs"
        }}"#,
        base = root.display(),
    ))
    .unwrap()
}

fn write_archive(path: &Path, files: &[(&str, &[u8])]) {
    let file = File::create(path).unwrap();
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

fn write_image(dir: &TempDir, builder: BundleBuilder, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    builder.write(&path).unwrap();
    path
}

fn store_metadata(pkg_type: &str, name: &str) -> Vec<(String, String)> {
    vec![
        ("type".to_string(), pkg_type.to_string()),
        ("appName".to_string(), name.to_string()),
    ]
}

#[test]
fn test_store_backend_full_lifecycle() {
    let root = tempdir().unwrap();
    let backend = StoreBackend::open(test_config(root.path())).unwrap();

    let archive = root.path().join("app.tar.gz");
    write_archive(&archive, &[("bin/app", b"#!/bin/sh\n"), ("assets/logo", b"png")]);

    backend
        .install(
            "com.example.app",
            "1.0",
            &store_metadata("application/bundle", "Example"),
            &archive,
        )
        .unwrap();

    let installed = backend.installed().unwrap();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].id, "com.example.app");
    assert_eq!(installed[0].name, "Example");

    // lock, then verify uninstall is refused until unlock
    let lease = backend.lock("com.example.app", "1.0").unwrap();
    assert!(lease.content_path.join("bin/app").exists());
    assert!(lease.manifest_path.is_none());

    let blocked = backend.uninstall("com.example.app");
    assert!(matches!(blocked.unwrap_err(), Error::AppLocked { .. }));

    backend.unlock("com.example.app", "1.0").unwrap();
    backend.uninstall("com.example.app").unwrap();

    // full round-trip cleanup: no content, no storage, no record
    assert!(!root.path().join("apps/com.example.app").exists());
    assert!(!root.path().join("data/com.example.app").exists());
    assert!(backend.installed().unwrap().is_empty());
}

#[test]
fn test_store_backend_duplicate_and_type_conflict() {
    let root = tempdir().unwrap();
    let backend = StoreBackend::open(test_config(root.path())).unwrap();

    let archive = root.path().join("app.tar.gz");
    write_archive(&archive, &[("f", b"x")]);

    let metadata = store_metadata("application/bundle", "App");
    backend.install("app", "1.0", &metadata, &archive).unwrap();

    let duplicate = backend.install("app", "1.0", &metadata, &archive);
    assert!(matches!(duplicate.unwrap_err(), Error::AlreadyInstalled { .. }));

    let conflicting = backend.install(
        "app",
        "2.0",
        &store_metadata("application/other", "App"),
        &archive,
    );
    assert!(matches!(conflicting.unwrap_err(), Error::WrongParams(_)));
}

#[test]
fn test_store_backend_survives_restart_and_reconciles() {
    let root = tempdir().unwrap();

    {
        let backend = StoreBackend::open(test_config(root.path())).unwrap();
        let archive = root.path().join("app.tar.gz");
        write_archive(&archive, &[("bin/app", b"x")]);
        backend
            .install("app", "1.0", &store_metadata("application/bundle", "App"), &archive)
            .unwrap();

        // a crashed install's leftovers: content without a record
        let orphan = root.path().join("apps/ghost/1.0");
        std::fs::create_dir_all(&orphan).unwrap();
        std::fs::write(orphan.join("junk"), b"x").unwrap();
    }

    // startup reconciliation removes the orphan, keeps the real install
    let backend = StoreBackend::open(test_config(root.path())).unwrap();
    assert!(!root.path().join("apps/ghost").exists());
    assert!(root.path().join("apps/app/1.0/bin/app").exists());
    assert_eq!(backend.installed().unwrap().len(), 1);
}

#[test]
fn test_upgrade_flow_preserves_user_data() {
    let root = tempdir().unwrap();
    let backend = StoreBackend::open(test_config(root.path())).unwrap();

    let archive = root.path().join("app.tar.gz");
    write_archive(&archive, &[("bin/app", b"v1")]);
    backend
        .install("app", "1.0", &store_metadata("application/bundle", "App"), &archive)
        .unwrap();
    std::fs::write(root.path().join("data/app/state"), b"saved game").unwrap();

    backend
        .orchestrator()
        .uninstall("application/bundle", "app", "1.0", UninstallMode::Upgrade)
        .unwrap();

    let archive2 = root.path().join("app2.tar.gz");
    write_archive(&archive2, &[("bin/app", b"v2")]);
    backend
        .install("app", "2.0", &store_metadata("application/bundle", "App"), &archive2)
        .unwrap();

    assert_eq!(
        std::fs::read(root.path().join("data/app/state")).unwrap(),
        b"saved game"
    );
    let listed = backend
        .orchestrator()
        .list(&RecordFilter::default())
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].version, "2.0");
}

#[test]
fn test_image_backend_dependency_scenario() {
    // Install app.a@1.0 depending on lib.b@>=1.0, with lib.b@1.2 installed.
    // Locking app.a must mount lib.b then app.a; a second lock is the fast
    // path and only raises app.a's refcount.
    let root = tempdir().unwrap();
    let config = test_config(root.path());
    let backend = ImageBackend::open_unverified(&config).unwrap();

    let lib = write_image(
        &root,
        BundleBuilder::new("lib.b", "1.2").file("lib/libb.so", b"lib"),
        "lib.img",
    );
    let app = write_image(
        &root,
        BundleBuilder::new("app.a", "1.0")
            .dependency("lib.b", ">=1.0")
            .file("bin/a", b"app"),
        "app.img",
    );
    backend.install("", "", &[], &lib).unwrap();
    backend.install("", "", &[], &app).unwrap();

    let first = backend.lock("app.a", "1.0").unwrap();
    assert_eq!(first.entries.len(), 2);
    assert!(first.entries[0].mount_path.contains("lib.b_1.2"));
    assert!(first.entries[1].mount_path.contains("app.a_1.0"));
    assert_eq!(backend.engine().mount_count("app.a", "1.0"), 1);
    assert_eq!(backend.engine().mount_count("lib.b", "1.2"), 1);

    // both payloads are actually on disk at their mount points
    assert!(first.content_path.join("bin/a").exists());
    assert!(
        Path::new(&first.entries[0].mount_path)
            .join("lib/libb.so")
            .exists()
    );

    // the manifest file round-trips with the documented shape
    let manifest: serde_json::Value = serde_json::from_slice(
        &std::fs::read(first.manifest_path.as_ref().unwrap()).unwrap(),
    )
    .unwrap();
    let packages = manifest["packages"].as_array().unwrap();
    assert_eq!(packages.len(), 2);
    assert!(packages[0]["pkgMountPath"].is_string());
    assert!(packages[0]["pkgMetaDataPath"].is_string());

    let second = backend.lock("app.a", "1.0").unwrap();
    assert_eq!(second.entries.len(), 1);
    assert_eq!(backend.engine().mount_count("app.a", "1.0"), 2);
    // lib.b was only mounted once in total, its refcount stays 1
    assert_eq!(backend.engine().mount_count("lib.b", "1.2"), 1);

    backend.unlock("app.a", "1.0").unwrap();
    assert_eq!(backend.engine().mount_count("app.a", "1.0"), 1);
    assert_eq!(backend.engine().mount_count("lib.b", "1.2"), 0);

    backend.unlock("app.a", "1.0").unwrap();
    assert_eq!(backend.engine().mounted_packages(), 0);
    assert!(!first.content_path.exists());
}

#[test]
fn test_image_backend_unresolved_dependency_leaves_no_partial_mounts() {
    let root = tempdir().unwrap();
    let backend = ImageBackend::open_unverified(&test_config(root.path())).unwrap();

    let lib = write_image(&root, BundleBuilder::new("lib.b", "1.0"), "lib.img");
    let app = write_image(
        &root,
        BundleBuilder::new("app.a", "1.0")
            .dependency("lib.b", ">=1.0")
            .dependency("lib.c", ">=2.0"),
        "app.img",
    );
    backend.install("", "", &[], &lib).unwrap();
    // install-time dependency checks would reject app.a; drop the image in
    // place directly to model a constraint that stopped resolving later
    std::fs::create_dir_all(root.path().join("images/app.a/1.0")).unwrap();
    std::fs::copy(&app, root.path().join("images/app.a/1.0/package.img")).unwrap();

    let backend = ImageBackend::open_unverified(&test_config(root.path())).unwrap();
    let err = backend.lock("app.a", "1.0").unwrap_err();
    assert!(matches!(err, Error::DependencyUnresolved { .. }));

    // the mount table is exactly as before the call
    assert_eq!(backend.engine().mounted_packages(), 0);
    assert_eq!(backend.engine().mount_count("lib.b", "1.0"), 0);
}

#[test]
fn test_image_backend_transitive_dependencies_mount_in_order() {
    let root = tempdir().unwrap();
    let backend = ImageBackend::open_unverified(&test_config(root.path())).unwrap();

    let base = write_image(&root, BundleBuilder::new("lib.base", "1.0"), "base.img");
    let mid = write_image(
        &root,
        BundleBuilder::new("lib.mid", "1.0").dependency("lib.base", ">=1.0"),
        "mid.img",
    );
    let app = write_image(
        &root,
        BundleBuilder::new("app", "1.0").dependency("lib.mid", ">=1.0"),
        "app.img",
    );
    backend.install("", "", &[], &base).unwrap();
    backend.install("", "", &[], &mid).unwrap();
    backend.install("", "", &[], &app).unwrap();

    let lease = backend.lock("app", "1.0").unwrap();
    assert_eq!(lease.entries.len(), 3);
    assert!(lease.entries[0].mount_path.contains("lib.base_1.0"));
    assert!(lease.entries[1].mount_path.contains("lib.mid_1.0"));
    assert!(lease.entries[2].mount_path.contains("app_1.0"));

    backend.unlock("app", "1.0").unwrap();
    assert_eq!(backend.engine().mounted_packages(), 0);
}

#[test]
fn test_backend_polymorphism() {
    let root = tempdir().unwrap();

    let store: Box<dyn PackageBackend> =
        backend::open(test_config(root.path()), BackendKind::Store).unwrap();
    let image: Box<dyn PackageBackend> =
        backend::open(test_config(root.path()), BackendKind::ImageUnverified).unwrap();

    for b in [&store, &image] {
        assert!(b.installed().unwrap().is_empty());
    }

    // the verified image backend refuses to start without trust anchors
    let verified = backend::open(test_config(root.path()), BackendKind::Image);
    assert!(matches!(
        verified.err(),
        Some(Error::VerificationFailed(_))
    ));
}

#[test]
fn test_unverified_mode_still_checks_payload_digests() {
    let root = tempdir().unwrap();
    let backend = ImageBackend::open_unverified(&test_config(root.path())).unwrap();

    // a bundle whose manifest lies about its payload digest
    let image_path = root.path().join("tampered.img");
    let manifest = serde_json::json!({
        "id": "app",
        "version": "1.0",
        "files": { "rootfs/bin/app": "00".repeat(32) }
    });
    let file = File::create(&image_path).unwrap();
    let encoder = GzEncoder::new(file, Compression::default());
    let mut tar_builder = tar::Builder::new(encoder);
    for (name, data) in [
        ("manifest.json", manifest.to_string().into_bytes()),
        ("rootfs/bin/app", b"actual content".to_vec()),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar_builder.append_data(&mut header, name, data.as_slice()).unwrap();
    }
    tar_builder.into_inner().unwrap().finish().unwrap();

    let err = backend.install("", "", &[], &image_path).unwrap_err();
    assert!(matches!(err, Error::VerificationFailed(_)));
}
