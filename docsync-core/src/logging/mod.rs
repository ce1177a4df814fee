//! Logging subsystem for docsync
//!
//! Installs a `tracing` subscriber for reactors, channels and the CLI.
//! `RUST_LOG` wins when set; otherwise the filter is built from the
//! configured level plus per-target directives.

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

mod error;
mod level;

pub use error::LoggingError;
pub use level::LogLevel;

/// Per-target directives applied on top of the level unless overridden.
/// The pool logs every checkout at debug.
const DEFAULT_DIRECTIVES: &[&str] = &["r2d2=warn"];

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub with_target: bool,
    /// Several reactors in one process are easier to tell apart with thread ids
    pub with_thread_ids: bool,
    pub json_format: bool,
    /// Extra `EnvFilter` directives such as `docsync_core::core_sync=trace`
    pub directives: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            with_target: true,
            with_thread_ids: false,
            json_format: false,
            directives: DEFAULT_DIRECTIVES.iter().map(|d| d.to_string()).collect(),
        }
    }
}

impl LogConfig {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Build from the `[logging]` section of the application config
    pub fn from_settings(settings: &LoggingConfig) -> Result<Self, LoggingError> {
        Ok(Self::new(settings.level.parse()?)
            .with_target(settings.with_target)
            .json_format(settings.json_format))
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    pub fn with_thread_ids(mut self, enabled: bool) -> Self {
        self.with_thread_ids = enabled;
        self
    }

    pub fn json_format(mut self, enabled: bool) -> Self {
        self.json_format = enabled;
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }

        let mut filter = EnvFilter::default().add_directive(LevelFilter::from(self.level).into());
        for directive in &self.directives {
            let parsed = directive
                .parse()
                .map_err(|e| LoggingError::InvalidConfiguration(format!("directive '{}': {}", directive, e)))?;
            filter = filter.add_directive(parsed);
        }
        Ok(filter)
    }
}

/// Install the default subscriber: info level, plain text
pub fn init_logging() -> Result<(), LoggingError> {
    init_logging_with_config(LogConfig::default())
}

/// Install a subscriber built from `config`. Fails if one is already installed.
///
/// ```
/// use docsync_core::logging::{init_logging_with_config, LogConfig, LogLevel};
///
/// let config = LogConfig::new(LogLevel::Debug).with_directive("docsync_core::core_sync=trace");
/// let _ = init_logging_with_config(config);
/// ```
pub fn init_logging_with_config(config: LogConfig) -> Result<(), LoggingError> {
    let fmt_layer = fmt::layer()
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids);

    let registry = tracing_subscriber::registry().with(config.env_filter()?);

    let result = if config.json_format {
        registry.with(fmt_layer.json()).try_init()
    } else {
        registry.with(fmt_layer).try_init()
    };

    result.map_err(|e| LoggingError::InitializationFailed(e.to_string()))
}
