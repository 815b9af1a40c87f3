//! Log output through the `tracing` ecosystem.
//!
//! The library only emits events; a binary calls [init_logging] once to decide where they go.
//! Output is written to stderr so that rows printed on stdout stay machine-readable.
//!
//! ```rust,ignore
//! use fuelcell_rig::logging::{init_logging, LogConfig, LogFormat};
//!
//! init_logging(&LogConfig {
//!     format: LogFormat::Compact,
//!     ..Default::default()
//! });
//! tracing::info!(port = "COM6", "load connected");
//! ```

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    /// Every frame on the wire.
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human-readable.
    Pretty,
    /// One line per event.
    #[default]
    Compact,
    /// Machine-readable.
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Directive string such as `fuelcell_rig::load=trace`, overriding `level` and `RUST_LOG`.
    pub filter: Option<String>,
    /// Include thread names, e.g. to tell the sweep thread apart.
    pub thread_names: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            filter: None,
            thread_names: false,
        }
    }
}

impl LogConfig {
    /// Level and thread names for debugging a rig session.
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            thread_names: true,
            ..Default::default()
        }
    }

    /// The filter this configuration resolves to.
    ///
    /// An explicit `filter` wins, then `RUST_LOG`, then `level`.
    pub fn env_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.to_string());
        match &self.filter {
            Some(custom) => EnvFilter::try_new(custom).unwrap_or_else(|_| fallback()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
        }
    }
}

/// Install the global subscriber. Calls after the first are ignored.
pub fn init_logging(config: &LogConfig) {
    let filter = config.env_filter();
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_thread_names(config.thread_names);

    let result = match config.format {
        LogFormat::Pretty => tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(filter)
                .with(layer.pretty()),
        ),
        LogFormat::Compact => tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(filter)
                .with(layer.compact()),
        ),
        LogFormat::Json => tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(filter).with(layer.json()),
        ),
    };

    // Already installed.
    let _ = result;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn level_names() {
        assert_eq!(LogLevel::Debug.to_string(), "debug");
        assert_eq!(LogLevel::from_str("warn").unwrap(), LogLevel::Warn);
        assert!(LogFormat::from_str("xml").is_err());
    }

    #[test]
    fn explicit_filter_wins() {
        let config = LogConfig {
            filter: Some("fuelcell_rig::load=trace".into()),
            ..Default::default()
        };
        assert_eq!(config.env_filter().to_string(), "fuelcell_rig::load=trace");
    }

    #[test]
    fn broken_filter_falls_back_to_level() {
        let config = LogConfig {
            level: LogLevel::Warn,
            filter: Some("fuelcell_rig=loud".into()),
            ..Default::default()
        };
        assert_eq!(config.env_filter().to_string(), "warn");
    }

    #[test]
    fn repeated_init_is_harmless() {
        init_logging(&LogConfig::default());
        init_logging(&LogConfig::verbose());
        tracing::info!("still logging");
    }
}
