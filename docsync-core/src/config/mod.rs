//! Configuration management for docsync
//!
//! Settings come from defaults, a TOML file, or `DOCSYNC_<SECTION>_<KEY>`
//! environment variables, and are validated before a reactor is built.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Durable storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding operations, keyframes, cursors, remotes and the document view
    pub database_path: PathBuf,

    /// Connection pool size
    pub pool_size: u32,

    /// Write a keyframe every N revisions of a stream
    pub keyframe_interval: u64,

    /// Capacity of the document header cache
    pub meta_cache_capacity: usize,
}

/// Channel and sync manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Interval between polls of a request channel
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// First retry delay after a transport failure; doubles per failure
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,

    /// Upper bound for the retry delay
    #[serde(with = "humantime_serde")]
    pub retry_max_delay: Duration,

    /// Consecutive failures after which polling stops
    pub max_failures: u32,

    /// Quiet window of buffered outboxes
    #[serde(with = "humantime_serde")]
    pub buffer_window: Duration,

    /// Pending callbacks that force an early buffered flush
    pub buffer_max_queued: usize,

    /// Operations per page when backfilling a new remote
    pub backfill_batch_size: usize,
}

/// Job queue and executor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Largest number of local operations a load may supersede
    pub max_skip_threshold: usize,

    /// Retries granted to a failed job before it is reported failed
    pub max_retries: u32,

    /// Number of executor workers
    pub worker_count: usize,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    pub json_format: bool,

    pub with_target: bool,
}

/// Metrics configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Register metric descriptions at startup
    pub enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/docsync.db"),
            pool_size: 16,
            keyframe_interval: 10,
            meta_cache_capacity: 1024,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(300),
            max_failures: 5,
            buffer_window: Duration::from_millis(500),
            buffer_max_queued: 25,
            backfill_batch_size: 500,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_skip_threshold: 1000,
            max_retries: 0,
            worker_count: 1,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_target: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn read_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(format!("{}: {}", key, e))),
        Err(_) => Ok(None),
    }
}

fn read_env_duration(key: &str) -> Result<Option<Duration>, ConfigError> {
    match env::var(key) {
        Ok(raw) => humantime_serde::re::humantime::parse_duration(&raw)
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(format!("{}: {}", key, e))),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern `DOCSYNC_<SECTION>_<KEY>`,
    /// e.g. `DOCSYNC_SYNC_POLL_INTERVAL=500ms`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = env::var("DOCSYNC_STORAGE_DATABASE_PATH") {
            config.storage.database_path = PathBuf::from(path);
        }
        if let Some(v) = read_env("DOCSYNC_STORAGE_POOL_SIZE")? {
            config.storage.pool_size = v;
        }
        if let Some(v) = read_env("DOCSYNC_STORAGE_KEYFRAME_INTERVAL")? {
            config.storage.keyframe_interval = v;
        }
        if let Some(v) = read_env("DOCSYNC_STORAGE_META_CACHE_CAPACITY")? {
            config.storage.meta_cache_capacity = v;
        }

        if let Some(v) = read_env_duration("DOCSYNC_SYNC_POLL_INTERVAL")? {
            config.sync.poll_interval = v;
        }
        if let Some(v) = read_env_duration("DOCSYNC_SYNC_RETRY_BASE_DELAY")? {
            config.sync.retry_base_delay = v;
        }
        if let Some(v) = read_env_duration("DOCSYNC_SYNC_RETRY_MAX_DELAY")? {
            config.sync.retry_max_delay = v;
        }
        if let Some(v) = read_env("DOCSYNC_SYNC_MAX_FAILURES")? {
            config.sync.max_failures = v;
        }
        if let Some(v) = read_env_duration("DOCSYNC_SYNC_BUFFER_WINDOW")? {
            config.sync.buffer_window = v;
        }
        if let Some(v) = read_env("DOCSYNC_SYNC_BUFFER_MAX_QUEUED")? {
            config.sync.buffer_max_queued = v;
        }

        if let Some(v) = read_env("DOCSYNC_QUEUE_MAX_SKIP_THRESHOLD")? {
            config.queue.max_skip_threshold = v;
        }
        if let Some(v) = read_env("DOCSYNC_QUEUE_MAX_RETRIES")? {
            config.queue.max_retries = v;
        }
        if let Some(v) = read_env("DOCSYNC_QUEUE_WORKER_COUNT")? {
            config.queue.worker_count = v;
        }

        if let Ok(level) = env::var("DOCSYNC_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(v) = read_env("DOCSYNC_LOG_JSON")? {
            config.logging.json_format = v;
        }
        if let Some(v) = read_env("DOCSYNC_METRICS_ENABLED")? {
            config.metrics.enabled = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.pool_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "storage.pool_size must be greater than 0".to_string(),
            ));
        }

        if self.sync.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "sync.poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.sync.retry_base_delay > self.sync.retry_max_delay {
            return Err(ConfigError::ValidationFailed(format!(
                "sync.retry_base_delay ({:?}) exceeds sync.retry_max_delay ({:?})",
                self.sync.retry_base_delay, self.sync.retry_max_delay
            )));
        }

        if self.sync.max_failures == 0 {
            return Err(ConfigError::ValidationFailed(
                "sync.max_failures must be greater than 0".to_string(),
            ));
        }

        if self.sync.buffer_max_queued == 0 || self.sync.backfill_batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "sync buffer and batch sizes must be greater than 0".to_string(),
            ));
        }

        if self.queue.worker_count == 0 {
            return Err(ConfigError::ValidationFailed(
                "queue.worker_count must be greater than 0".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "warning", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWrite {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Ok(())
    }
}
