use std::io;

use agent_engine::EngineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliEngineError {
    #[error("agent executable `{executable}` not found: {message}")]
    ExecutableNotFound { executable: String, message: String },

    #[error("failed to spawn agent process: {0}")]
    Spawn(#[source] io::Error),

    #[error("agent process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("failed to write to agent process: {0}")]
    Write(#[source] io::Error),

    #[error("failed to encode agent message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("agent process is not accepting input")]
    InputClosed,

    #[error("control request `{subtype}` failed: {message}")]
    ControlFailed { subtype: String, message: String },

    #[error("control request `{0}` timed out")]
    ControlTimeout(String),
}

impl From<CliEngineError> for EngineError {
    fn from(error: CliEngineError) -> Self {
        match &error {
            CliEngineError::ExecutableNotFound { .. } => {
                EngineError::configuration(error.to_string())
            }
            CliEngineError::Spawn(source) if source.kind() == io::ErrorKind::NotFound => {
                EngineError::configuration(error.to_string())
            }
            CliEngineError::InputClosed => EngineError::Closed,
            CliEngineError::Encode(_) | CliEngineError::ControlFailed { .. } => {
                EngineError::protocol(error.to_string())
            }
            _ => EngineError::process(error.to_string()),
        }
    }
}
