use std::io;

use agent_engine::EngineError;
use orchestrator::OrchestratorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid {var}='{value}': {reason}")]
    InvalidConfig {
        var: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("unsupported engine '{0}'. Available engines: {1}")]
    UnsupportedEngine(String, &'static str),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BridgeError {
    #[must_use]
    pub fn invalid(var: &'static str, value: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidConfig {
            var,
            value: value.into(),
            reason,
        }
    }
}
