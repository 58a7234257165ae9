use stream_channel::ChannelError;
use thiserror::Error;

/// Error returned by an execution engine or its query control handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Setup problem detected before any turn runs (missing executable,
    /// invalid options). Never retried.
    #[error("engine configuration error: {0}")]
    Configuration(String),

    #[error("engine process error: {0}")]
    Process(String),

    #[error("engine protocol error: {0}")]
    Protocol(String),

    #[error("engine operation unsupported: {0}")]
    Unsupported(&'static str),

    #[error("engine query is closed")]
    Closed,

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl EngineError {
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    #[must_use]
    pub fn process(message: impl Into<String>) -> Self {
        Self::Process(message.into())
    }

    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Returns true for errors that must surface as fatal start failures.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}
