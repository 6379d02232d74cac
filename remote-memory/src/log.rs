//! Logging Setup
//!
//! The crate emits `tracing` events with structured fields (`buffer`,
//! `handle`, `bytes`). This module installs a `tracing-subscriber` fmt
//! subscriber for applications that do not set up their own.
//!
//! The `REMOTE_MEMORY_LOG` environment variable, if set, takes an
//! `EnvFilter` directive string (e.g. `remote_memory=trace`) and overrides
//! the configured level.
//!
//! # Example
//!
//! ```rust,ignore
//! use remote_memory::config::LogConfig;
//!
//! remote_memory::log::init(&LogConfig::default());
//! ```

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogLevel};

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV_VAR: &str = "REMOTE_MEMORY_LOG";

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Install the global subscriber.
///
/// Returns `false` if a global subscriber was already installed, in which
/// case that one stays in effect.
pub fn init(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| {
        EnvFilter::default().add_directive(LevelFilter::from(config.level).into())
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_thread_names(true);

    if config.timestamps {
        builder.try_init().is_ok()
    } else {
        builder.without_time().try_init().is_ok()
    }
}
