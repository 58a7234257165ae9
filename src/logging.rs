//! Structured logging to stderr. Stdout carries the envelope stream.

use tracing_subscriber::EnvFilter;

use crate::error::BridgeError;

pub const DEFAULT_LOG_FILTER: &str = "info";

/// Installs the global subscriber. `filter` uses `EnvFilter` directive
/// syntax; an invalid one falls back to [`DEFAULT_LOG_FILTER`].
pub fn init(filter: Option<&str>) -> Result<(), BridgeError> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(filter))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init()
        .map_err(|error| BridgeError::Logging(error.to_string()))
}

fn env_filter(filter: Option<&str>) -> EnvFilter {
    filter
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}
