// src/main.rs

use anyhow::Result;
use berth::backend::{self, BackendKind, PackageBackend};
use berth::image::BundleBuilder;
use berth::Config;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    /// Archive + record-store backend
    Store,
    /// Signed bundle images with dependency-aware mounting
    Image,
    /// Image backend with signature checks disabled (legacy)
    ImageUnverified,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Store => BackendKind::Store,
            BackendArg::Image => BackendKind::Image,
            BackendArg::ImageUnverified => BackendKind::ImageUnverified,
        }
    }
}

#[derive(Parser)]
#[command(name = "berth")]
#[command(author, version, about = "On-device package manager with dependency-aware mounting", long_about = None)]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Backend to operate on
    #[arg(short, long, global = true, value_enum, default_value = "store")]
    backend: BackendArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a package from a local file
    Install {
        /// Path to the package file
        locator: PathBuf,
        /// Package id (image backend reads it from the manifest if omitted)
        #[arg(long, default_value = "")]
        id: String,
        /// Package version
        #[arg(long, default_value = "")]
        version: String,
        /// Package type, e.g. application/bundle
        #[arg(long, default_value = "application/bundle")]
        pkg_type: String,
        /// Display name
        #[arg(long, default_value = "")]
        name: String,
        /// Category
        #[arg(long, default_value = "")]
        category: String,
    },
    /// Uninstall a package entirely
    Uninstall {
        /// Package id
        id: String,
    },
    /// List installed packages
    List,
    /// Lock a package for execution (mounts it and its dependencies)
    Lock {
        id: String,
        version: String,
    },
    /// Release a lock taken with `lock`
    Unlock {
        id: String,
        version: String,
    },
    /// Show identity information from a package file
    Info {
        /// Path to the package file
        locator: PathBuf,
    },
    /// Create a bundle image from a directory tree
    Pack {
        /// Directory with the payload content
        source: PathBuf,
        /// Output image file
        output: PathBuf,
        #[arg(long)]
        id: String,
        #[arg(long)]
        version: String,
        /// Dependency constraint, `<id>=<range>`; repeatable
        #[arg(long = "depends")]
        depends: Vec<String>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_json(&std::fs::read_to_string(path)?)?,
        None => Config::from_json("")?,
    };
    Ok(config)
}

fn open_backend(cli: &Cli) -> Result<Box<dyn PackageBackend>> {
    let config = load_config(cli.config.as_ref())?;
    Ok(backend::open(config, cli.backend.into())?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Install {
            locator,
            id,
            version,
            pkg_type,
            name,
            category,
        } => {
            let backend = open_backend(&cli)?;
            let metadata = vec![
                ("type".to_string(), pkg_type.clone()),
                ("appName".to_string(), name.clone()),
                ("category".to_string(), category.clone()),
            ];
            backend.install(id, version, &metadata, locator)?;
            println!("Installed {}", locator.display());
        }
        Commands::Uninstall { id } => {
            let backend = open_backend(&cli)?;
            backend.uninstall(id)?;
            println!("Uninstalled {id}");
        }
        Commands::List => {
            let backend = open_backend(&cli)?;
            let installed = backend.installed()?;
            if installed.is_empty() {
                println!("No packages installed");
            }
            for details in installed {
                if details.version.is_empty() {
                    println!("{} (storage only)", details.id);
                } else {
                    println!("{} {} {}", details.id, details.version, details.name);
                }
            }
        }
        Commands::Lock { id, version } => {
            let backend = open_backend(&cli)?;
            let lease = backend.lock(id, version)?;
            println!("Locked {id}:{version} at {}", lease.content_path.display());
            if let Some(manifest) = &lease.manifest_path {
                println!("Manifest: {}", manifest.display());
            }
        }
        Commands::Unlock { id, version } => {
            let backend = open_backend(&cli)?;
            backend.unlock(id, version)?;
            println!("Unlocked {id}:{version}");
        }
        Commands::Info { locator } => {
            let backend = open_backend(&cli)?;
            let metadata = backend.file_metadata(locator)?;
            println!("id:      {}", metadata.id);
            println!("version: {}", metadata.version);
            println!("path:    {}", metadata.path.display());
        }
        Commands::Pack {
            source,
            output,
            id,
            version,
            depends,
        } => {
            let mut builder = BundleBuilder::new(id, version).add_dir(source)?;
            for dep in depends {
                let (dep_id, range) = dep.split_once('=').ok_or_else(|| {
                    anyhow::anyhow!("dependency must be <id>=<range>, got '{dep}'")
                })?;
                builder = builder.dependency(dep_id, range);
            }
            builder.write(output)?;
            info!("wrote bundle {}", output.display());
            println!("Packed {} -> {}", source.display(), output.display());
        }
    }

    Ok(())
}
