//! Structured logging setup.
//!
//! The core logs through `tracing` with structured fields; the host decides
//! when to install a subscriber. `init_logging` wires an env-filtered
//! formatter in the requested format.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::error::{CoreError, Result};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON for production / structured collection.
    Json,
    /// Human-readable, single line.
    #[default]
    Compact,
    /// Multi-line developer output.
    Pretty,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `nucleus_core=debug`. `RUST_LOG`
    /// overrides it when set.
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            include_target: true,
        }
    }
}

/// Install the global tracing subscriber. Fails when a subscriber is
/// already set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| CoreError::Internal(format!("invalid log filter: {e}")))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(config.include_target))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_target(config.include_target))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_target(config.include_target))
            .try_init(),
    };
    result.map_err(|e| CoreError::Internal(format!("failed to install subscriber: {e}")))
}
