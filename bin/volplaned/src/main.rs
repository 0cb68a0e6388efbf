//! Volplane control plane daemon
//!
//! Opens the metadata store and runs the image, snapshot and OS snapshot
//! reconcilers against the block backend until interrupted.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use volplane_block::{LocalContentSource, MemoryBackend};
use volplane_controller::Controller;
use volplane_kms::Kms;
use volplane_meta_store::{MetaStore, StoreOptions};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "volplaned")]
#[command(about = "Volplane storage control plane")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/volplane/volplane.toml")]
    config: PathBuf,

    /// Directory holding the metadata database
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Key-encryption key file (32 raw bytes)
    #[arg(long)]
    kek_file: Option<PathBuf>,

    /// Generate the key-encryption key file if it does not exist
    #[arg(long)]
    create_kek: bool,

    /// Root directory of OS images
    #[arg(long)]
    content_dir: Option<PathBuf>,

    /// Backend pool
    #[arg(long)]
    pool: Option<String>,

    /// Worker tasks per reconciler
    #[arg(long)]
    workers: Option<usize>,

    /// Log level
    #[arg(long, env = "VOLPLANE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (text / json)
    #[arg(long)]
    log_format: Option<String>,
}

fn init_tracing(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());
    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_kek(path: &Path, create: bool) -> Result<Kms> {
    if create && !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        std::fs::write(path, Kms::generate_key())
            .with_context(|| format!("write key-encryption key {}", path.display()))?;
        warn!(path = %path.display(), "generated new key-encryption key");
    }
    Kms::from_file(path).with_context(|| format!("load key-encryption key {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::load(&args.config)?;

    // CLI takes precedence over the config file
    if let Some(data_dir) = args.data_dir {
        config.controller.data_dir = data_dir;
    }
    if let Some(kek_file) = args.kek_file {
        config.controller.kek_file = kek_file;
    }
    if let Some(content_dir) = args.content_dir {
        config.backend.content_dir = content_dir;
    }
    if let Some(pool) = args.pool {
        config.backend.pool = pool;
    }
    if let Some(workers) = args.workers {
        config.controller.workers = workers;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    init_tracing(&config.logging.level, &config.logging.format);

    info!("Starting Volplane controller");
    info!("Config file: {}", args.config.display());
    info!("Data directory: {}", config.controller.data_dir.display());

    std::fs::create_dir_all(&config.controller.data_dir).with_context(|| {
        format!("create data_dir {}", config.controller.data_dir.display())
    })?;
    let store = MetaStore::open(config.controller.data_dir.join("meta.redb"))
        .context("open metadata store")?
        .with_options(StoreOptions {
            watch_buffer: config.controller.watch_buffer,
        });

    let kms = Arc::new(load_kek(&config.controller.kek_file, args.create_kek)?);

    info!(
        pool = %config.backend.pool,
        content_dir = %config.backend.content_dir.display(),
        "using in-memory block backend"
    );
    let backend = Arc::new(MemoryBackend::new());
    let source = Arc::new(LocalContentSource::new(&config.backend.content_dir));

    let controller = Controller::new(
        &store,
        backend,
        source,
        kms,
        config.reconciler_options(),
    )
    .context("create controller")?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        stop_tx.send_replace(true);
    });

    controller.run(stop_rx).await.context("controller failed")?;
    info!("Volplane controller stopped");
    Ok(())
}
