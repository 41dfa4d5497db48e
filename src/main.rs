use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::info;

mod config;
mod digest;
mod error;
mod mirror;
mod oci;
mod package;
mod pusher;
mod repo;
mod runner;
mod tasks;

use config::Config;
use mirror::Mirror;

#[derive(Parser)]
#[command(name = "conda-oci-mirror")]
#[command(version)]
#[command(about = "Mirror conda channels into OCI-compatible registries", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SharedOpts {
    /// Channel to mirror
    #[arg(short, long, default_value = "conda-forge")]
    channel: String,

    /// Subdirectory (platform) to include; defaults to all known platforms
    #[arg(short, long = "subdir")]
    subdir: Vec<String>,

    /// Glob pattern selecting package names; repeatable
    #[arg(short, long = "package")]
    package: Vec<String>,

    /// Registry to push to, e.g. ghcr.io/myuser (mandatory unless --dry-run)
    #[arg(long)]
    registry: Option<String>,

    /// Don't upload any blobs
    #[arg(long, action = ArgAction::SetTrue, overrides_with = "no_dry_run")]
    dry_run: bool,

    /// Negate a previously given --dry-run
    #[arg(long = "no-dry-run", action = ArgAction::SetTrue)]
    no_dry_run: bool,

    /// Path to the local cache directory (default: $PWD/cache)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Number of pool workers
    #[arg(long)]
    workers: Option<usize>,

    /// Per-registry-request timeout in milliseconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Only print warnings and errors
    #[arg(long, action = ArgAction::SetTrue)]
    quiet: bool,

    /// Print debug output
    #[arg(long, action = ArgAction::SetTrue)]
    debug: bool,

    /// Configuration file (optional)
    #[arg(long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror missing archives from upstream into the registry
    Mirror {
        #[command(flatten)]
        opts: SharedOpts,
    },
    /// Pull the latest published artifacts into the local cache
    PullCache {
        #[command(flatten)]
        opts: SharedOpts,
    },
    /// Push local cache archives to the registry
    PushCache {
        #[command(flatten)]
        opts: SharedOpts,

        /// Push every local archive, not just new ones
        #[arg(long, action = ArgAction::SetTrue)]
        push_all: bool,
    },
    /// Initialize configuration file
    Init {
        /// Output path for config file
        #[arg(short, long, default_value = "conda-oci-mirror.json")]
        output: String,
    },
}

fn init_logging(opts: &SharedOpts) {
    let level = if opts.debug {
        tracing::Level::DEBUG
    } else if opts.quiet {
        tracing::Level::WARN
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();
}

fn build_mirror(opts: &SharedOpts) -> Result<Mirror> {
    let mut config = if let Some(config_path) = &opts.config {
        Config::load_from_file(config_path)?
    } else {
        Config::default()
    };
    if let Some(workers) = opts.workers {
        config.workers = workers;
    }
    if let Some(timeout) = opts.timeout {
        config.timeout_ms = timeout;
    }

    if opts.registry.is_none() && !opts.dry_run {
        return Err(anyhow::anyhow!(
            "--registry is required unless --dry-run is given"
        ));
    }

    Ok(Mirror::new(
        Some(opts.channel.clone()),
        Some(opts.subdir.clone()),
        Some(opts.package.clone()),
        opts.registry.clone(),
        opts.cache_dir.clone(),
        config,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Mirror { opts } => {
            init_logging(&opts);
            let mirror = build_mirror(&opts)?;
            let receipts = mirror.update(opts.dry_run, false, false).await?;
            info!("Mirrored {} artifact(s)", receipts.len());
        }
        Commands::PullCache { opts } => {
            init_logging(&opts);
            let mirror = build_mirror(&opts)?;
            let paths = mirror.pull_latest(opts.dry_run, false).await?;
            info!("Pulled {} file(s)", paths.len());
        }
        Commands::PushCache { opts, push_all } => {
            init_logging(&opts);
            let mirror = build_mirror(&opts)?;
            let receipts = if push_all {
                mirror.push_all(opts.dry_run, false).await?
            } else {
                mirror.push_new(opts.dry_run, false).await?
            };
            info!("Pushed {} artifact(s)", receipts.len());
        }
        Commands::Init { output } => {
            let config = Config::default();
            config.save_to_file(&output)?;
            println!("Configuration file created at {output}");
        }
    }

    Ok(())
}
