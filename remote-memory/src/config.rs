//! Memory Table Configuration
//!
//! Configuration can be set programmatically or loaded from environment
//! variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `REMOTE_MEMORY_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `REMOTE_MEMORY_NURSERY` | Cache freed allocations for reuse ("true"/"false") | true |
//! | `REMOTE_MEMORY_NURSERY_MAX_BYTES` | Maximum bytes held by the nursery (0 = unlimited) | 0 |
//! | `REMOTE_MEMORY_CLEAN_ON_PRESSURE` | Sweep dead buffers when allocation fails | true |
//! | `REMOTE_MEMORY_PURGE_ON_PRESSURE` | Flush the nursery when allocation still fails | true |
//! | `REMOTE_MEMORY_FINALIZATION` | Finalization mode (immediate/deferred) | immediate |
//! | `REMOTE_MEMORY_FINALIZER_INTERVAL_MS` | Background collection interval in milliseconds (0 = no thread) | 0 |
//! | `REMOTE_MEMORY_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! # Example
//!
//! ```rust,ignore
//! use remote_memory::config::MemoryConfig;
//!
//! // Load from environment with defaults
//! let config = MemoryConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = MemoryConfig::builder()
//!     .nursery_max_bytes(256 * 1024 * 1024)
//!     .finalization(FinalizationMode::Deferred)
//!     .finalizer_interval(Some(Duration::from_millis(50)))
//!     .build()?;
//! ```

use std::env;
use std::time::Duration;

use tracing::warn;

use crate::error::ConfigError;
use crate::liveness::FinalizationMode;

/// Log level for the memory table's tracing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Nursery configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NurseryConfig {
    /// Cache freed allocations for reuse.
    /// Default: true.
    pub enabled: bool,

    /// Maximum bytes cached; frees beyond this go straight to the backend.
    /// 0 means unlimited (default).
    pub max_cached_bytes: usize,
}

impl Default for NurseryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_cached_bytes: 0,
        }
    }
}

/// Recovery steps taken when the backend cannot satisfy an allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimConfig {
    /// Sweep entries of dead buffers and retry the nursery.
    /// Default: true.
    pub clean_on_pressure: bool,

    /// Flush the nursery to the backend and retry allocation.
    /// Default: true.
    pub purge_on_pressure: bool,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            clean_on_pressure: true,
            purge_on_pressure: true,
        }
    }
}

/// Collector configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CollectorConfig {
    /// When death callbacks run.
    /// Default: immediate.
    pub mode: FinalizationMode,

    /// Interval of the background finalizer thread.
    /// None means no thread (default). Requires deferred mode.
    pub finalizer_interval: Option<Duration>,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Log level.
    /// Default: Info.
    pub level: LogLevel,

    /// Include timestamps in log output.
    /// Default: true.
    pub timestamps: bool,

    /// Include source location in log output.
    /// Default: false (only in debug builds).
    pub source_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            timestamps: true,
            source_location: cfg!(debug_assertions),
        }
    }
}

/// Complete configuration.
///
/// Use `MemoryConfig::default()` for sensible defaults, or
/// `MemoryConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemoryConfig {
    /// Nursery configuration.
    pub nursery: NurseryConfig,

    /// Allocation-pressure recovery.
    pub reclaim: ReclaimConfig,

    /// Collector configuration.
    pub collector: CollectorConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl MemoryConfig {
    /// Create a new builder for MemoryConfig.
    pub fn builder() -> MemoryConfigBuilder {
        MemoryConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are not set keep their default values. Variables
    /// that are set but do not parse are logged and ignored; use
    /// [`MemoryConfig::try_from_env`] to reject them instead.
    pub fn from_env() -> Self {
        Self::read_env(false).unwrap_or_default()
    }

    /// Load configuration from environment variables, failing on any
    /// variable that is set but does not parse.
    pub fn try_from_env() -> Result<Self, ConfigError> {
        Self::read_env(true)
    }

    fn read_env(strict: bool) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Nursery configuration
        if let Some(val) = lenient(parse_env_bool("REMOTE_MEMORY_NURSERY"), strict)? {
            config.nursery.enabled = val;
        }

        if let Some(val) = lenient(parse_env_usize("REMOTE_MEMORY_NURSERY_MAX_BYTES"), strict)? {
            config.nursery.max_cached_bytes = val;
        }

        // Reclaim configuration
        if let Some(val) = lenient(parse_env_bool("REMOTE_MEMORY_CLEAN_ON_PRESSURE"), strict)? {
            config.reclaim.clean_on_pressure = val;
        }

        if let Some(val) = lenient(parse_env_bool("REMOTE_MEMORY_PURGE_ON_PRESSURE"), strict)? {
            config.reclaim.purge_on_pressure = val;
        }

        // Collector configuration
        let mode = parse_env_with("REMOTE_MEMORY_FINALIZATION", "immediate or deferred", |s| {
            FinalizationMode::from_str(s)
        });
        if let Some(mode) = lenient(mode, strict)? {
            config.collector.mode = mode;
        }

        let interval = parse_env_usize("REMOTE_MEMORY_FINALIZER_INTERVAL_MS");
        if let Some(val) = lenient(interval, strict)? {
            config.collector.finalizer_interval = if val > 0 {
                Some(Duration::from_millis(val as u64))
            } else {
                None
            };
        }

        // Logging configuration
        let level = parse_env_with("REMOTE_MEMORY_LOG_LEVEL", "a log level", LogLevel::from_str);
        if let Some(level) = lenient(level, strict)? {
            config.log.level = level;
        }

        Ok(config)
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(interval) = self.collector.finalizer_interval {
            if interval.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: "collector.finalizer_interval".into(),
                    message: "must be non-zero".into(),
                });
            }

            if self.collector.mode != FinalizationMode::Deferred {
                return Err(ConfigError::InvalidValue {
                    field: "collector.finalizer_interval".into(),
                    message: "a finalizer thread requires deferred finalization".into(),
                });
            }
        }

        if !self.nursery.enabled && self.nursery.max_cached_bytes != 0 {
            return Err(ConfigError::InvalidValue {
                field: "nursery.max_cached_bytes".into(),
                message: "set on a disabled nursery".into(),
            });
        }

        Ok(())
    }
}

/// Builder for MemoryConfig.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigBuilder {
    config: MemoryConfig,
}

impl MemoryConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the nursery.
    pub fn nursery(mut self, enabled: bool) -> Self {
        self.config.nursery.enabled = enabled;
        self
    }

    /// Set the nursery byte bound (0 = unlimited).
    pub fn nursery_max_bytes(mut self, bytes: usize) -> Self {
        self.config.nursery.max_cached_bytes = bytes;
        self
    }

    /// Enable or disable the clean step of the allocation ladder.
    pub fn clean_on_pressure(mut self, enabled: bool) -> Self {
        self.config.reclaim.clean_on_pressure = enabled;
        self
    }

    /// Enable or disable the purge step of the allocation ladder.
    pub fn purge_on_pressure(mut self, enabled: bool) -> Self {
        self.config.reclaim.purge_on_pressure = enabled;
        self
    }

    /// Set the finalization mode.
    pub fn finalization(mut self, mode: FinalizationMode) -> Self {
        self.config.collector.mode = mode;
        self
    }

    /// Set the background finalizer interval.
    pub fn finalizer_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.collector.finalizer_interval = interval;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Include or omit timestamps in log output.
    pub fn log_timestamps(mut self, enabled: bool) -> Self {
        self.config.log.timestamps = enabled;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<MemoryConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> MemoryConfig {
        self.config
    }
}

/// Drop a parse error unless `strict`.
fn lenient<T>(
    parsed: Result<Option<T>, ConfigError>,
    strict: bool,
) -> Result<Option<T>, ConfigError> {
    match parsed {
        Err(err) if !strict => {
            warn!(%err, "ignoring environment variable");
            Ok(None)
        }
        other => other,
    }
}

/// Parse an environment variable with `parse`.
///
/// `Ok(None)` if the variable is unset; `EnvParse` if it is set but
/// `parse` rejects it.
fn parse_env_with<T>(
    name: &str,
    expected: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Result<Option<T>, ConfigError> {
    let Ok(raw) = env::var(name) else {
        return Ok(None);
    };
    match parse(raw.trim()) {
        Some(val) => Ok(Some(val)),
        None => Err(ConfigError::EnvParse {
            var: name.into(),
            message: format!("expected {}, got {:?}", expected, raw),
        }),
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Result<Option<usize>, ConfigError> {
    parse_env_with(name, "an unsigned integer", |s| s.parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Result<Option<bool>, ConfigError> {
    parse_env_with(name, "a boolean", |s| match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    })
}
