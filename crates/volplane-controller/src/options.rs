//! Controller tuning

use crate::error::{ReconcileError, ReconcileResult};
use std::time::Duration;

/// Default number of workers per reconciler
pub const DEFAULT_WORKERS: usize = 15;

/// Default interval between full re-lists
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default buffer for content population (4 MiB)
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Per-key exponential backoff for failed reconciles
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound on any delay
    pub max_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
        }
    }
}

/// Settings shared by all reconcilers of one controller
#[derive(Clone, Debug)]
pub struct ReconcilerOptions {
    /// Backend pool the devices live in
    pub pool: String,
    /// Client identity whose credentials are handed out with images
    pub client_name: String,
    /// Cluster monitor addresses handed out with images
    pub monitors: Vec<String>,
    /// Worker tasks per reconciler
    pub workers: usize,
    pub resync_interval: Duration,
    pub queue: QueueConfig,
    /// Buffer used when streaming content into a device
    pub copy_buffer_size: usize,
    /// How often the copy rate is logged during population
    pub rate_report_interval: Duration,
}

impl ReconcilerOptions {
    pub fn new(pool: impl Into<String>, client_name: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            client_name: client_name.into(),
            monitors: Vec::new(),
            workers: DEFAULT_WORKERS,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            queue: QueueConfig::default(),
            copy_buffer_size: DEFAULT_COPY_BUFFER_SIZE,
            rate_report_interval: Duration::from_secs(10),
        }
    }

    /// Check that everything a reconciler needs is present
    pub fn validate(&self) -> ReconcileResult<()> {
        if self.pool.is_empty() {
            return Err(ReconcileError::MissingDependency("pool".to_string()));
        }
        if self.client_name.is_empty() {
            return Err(ReconcileError::MissingDependency("client name".to_string()));
        }
        if self.workers == 0 {
            return Err(ReconcileError::MissingDependency(
                "at least one worker".to_string(),
            ));
        }
        if self.copy_buffer_size == 0 {
            return Err(ReconcileError::MissingDependency(
                "copy buffer size".to_string(),
            ));
        }
        if self.resync_interval.is_zero() || self.rate_report_interval.is_zero() {
            return Err(ReconcileError::MissingDependency(
                "non-zero intervals".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let options = ReconcilerOptions::new("rbd", "volplane");
        assert_eq!(options.workers, 15);
        assert!(options.validate().is_ok());
        assert_eq!(options.queue.base_delay, Duration::from_millis(5));
        assert_eq!(options.queue.max_delay, Duration::from_secs(1000));
    }

    #[test]
    fn test_missing_dependencies() {
        let cases = [
            ReconcilerOptions::new("", "volplane"),
            ReconcilerOptions::new("rbd", ""),
            ReconcilerOptions {
                workers: 0,
                ..ReconcilerOptions::new("rbd", "volplane")
            },
            ReconcilerOptions {
                copy_buffer_size: 0,
                ..ReconcilerOptions::new("rbd", "volplane")
            },
        ];
        for options in cases {
            assert!(matches!(
                options.validate(),
                Err(ReconcileError::MissingDependency(_))
            ));
        }
    }
}
