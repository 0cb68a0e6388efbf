//! Daemon configuration file

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use volplane_controller::{DEFAULT_WORKERS, ReconcilerOptions};

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ControllerConfig {
    /// Directory holding the metadata database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// File with the 32-byte key-encryption key
    #[serde(default = "default_kek_file")]
    pub kek_file: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
    /// Per-subscriber watch channel capacity
    #[serde(default = "default_watch_buffer")]
    pub watch_buffer: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            kek_file: default_kek_file(),
            workers: default_workers(),
            resync_interval_secs: default_resync_interval_secs(),
            watch_buffer: default_watch_buffer(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_pool")]
    pub pool: String,
    /// Client identity whose credentials are handed out with images
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default)]
    pub monitors: Vec<String>,
    /// Root directory of OS images referenced by content sources
    #[serde(default = "default_content_dir")]
    pub content_dir: PathBuf,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            pool: default_pool(),
            client_name: default_client_name(),
            monitors: Vec::new(),
            content_dir: default_content_dir(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./volplane-data")
}

fn default_kek_file() -> PathBuf {
    PathBuf::from("./volplane-data/kek")
}

const fn default_workers() -> usize {
    DEFAULT_WORKERS
}

const fn default_resync_interval_secs() -> u64 {
    30
}

const fn default_watch_buffer() -> usize {
    128
}

fn default_pool() -> String {
    "rbd".to_string()
}

fn default_client_name() -> String {
    "volplane".to_string()
}

fn default_content_dir() -> PathBuf {
    PathBuf::from("./volplane-data/content")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load the file if it exists, otherwise use defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn reconciler_options(&self) -> ReconcilerOptions {
        ReconcilerOptions {
            monitors: self.backend.monitors.clone(),
            workers: self.controller.workers,
            resync_interval: Duration::from_secs(self.controller.resync_interval_secs),
            ..ReconcilerOptions::new(&self.backend.pool, &self.backend.client_name)
        }
    }
}
