//! Tracing setup for embedders and the worker binary
//!
//! Output always goes to stderr: the worker's stdout carries frames.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::error::{PluginResult, PluginRuntimeError};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "plugin_runtime_core=info,plugin=info";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, for development
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Install the global subscriber.
///
/// # Errors
///
/// `ConfigurationError` if a global subscriber is already installed.
pub fn init_tracing(format: LogFormat) -> PluginResult<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let result = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .try_init(),
    };

    result.map_err(|e| PluginRuntimeError::ConfigurationError(format!("tracing already initialized: {e}")))
}
