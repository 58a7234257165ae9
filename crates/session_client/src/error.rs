use orchestrator::OrchestratorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{kind} failed: {message}")]
    Rejected { kind: String, message: String },

    #[error("could not encode {kind} request: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Transport(#[from] OrchestratorError),

    #[error("connection dropped before {0} was answered")]
    Disconnected(&'static str),

    #[error("no projection for session '{0}'")]
    UnknownSession(String),

    #[error("permission request '{0}' is not queued")]
    UnknownPermissionRequest(String),
}

impl ClientError {
    #[must_use]
    pub fn rejected(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            kind: kind.into(),
            message: message.into(),
        }
    }
}
