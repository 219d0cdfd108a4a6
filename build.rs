// build.rs

use clap::{Arg, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn build_cli() -> Command {
    Command::new("berth")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Berth Contributors")
        .about("On-device package manager with dependency-aware mounting")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .global(true)
                .help("Path to a JSON configuration file"),
        )
        .arg(
            Arg::new("backend")
                .short('b')
                .long("backend")
                .value_parser(["store", "image", "image-unverified"])
                .default_value("store")
                .global(true)
                .help("Backend to operate on"),
        )
        .subcommand(
            Command::new("install")
                .about("Install a package from a local file")
                .arg(Arg::new("locator").required(true).help("Path to the package file"))
                .arg(Arg::new("id").long("id").help("Package id"))
                .arg(Arg::new("version").long("version").help("Package version"))
                .arg(
                    Arg::new("pkg_type")
                        .long("pkg-type")
                        .default_value("application/bundle")
                        .help("Package type"),
                )
                .arg(Arg::new("name").long("name").help("Display name"))
                .arg(Arg::new("category").long("category").help("Category")),
        )
        .subcommand(
            Command::new("uninstall")
                .about("Uninstall a package entirely")
                .arg(Arg::new("id").required(true).help("Package id")),
        )
        .subcommand(Command::new("list").about("List installed packages"))
        .subcommand(
            Command::new("lock")
                .about("Lock a package for execution (mounts it and its dependencies)")
                .arg(Arg::new("id").required(true))
                .arg(Arg::new("version").required(true)),
        )
        .subcommand(
            Command::new("unlock")
                .about("Release a lock taken with lock")
                .arg(Arg::new("id").required(true))
                .arg(Arg::new("version").required(true)),
        )
        .subcommand(
            Command::new("info")
                .about("Show identity information from a package file")
                .arg(Arg::new("locator").required(true).help("Path to the package file")),
        )
        .subcommand(
            Command::new("pack")
                .about("Create a bundle image from a directory tree")
                .arg(Arg::new("source").required(true).help("Directory with the payload content"))
                .arg(Arg::new("output").required(true).help("Output image file"))
                .arg(Arg::new("id").long("id").required(true))
                .arg(Arg::new("version").long("version").required(true))
                .arg(
                    Arg::new("depends")
                        .long("depends")
                        .action(clap::ArgAction::Append)
                        .help("Dependency constraint, <id>=<range>; repeatable"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    // Generate main man page
    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("Failed to render man page");

    let man_path = man_dir.join("berth.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");

    println!("cargo:warning=Man page generated at {}", man_path.display());
}
