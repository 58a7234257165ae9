use agent_engine::EngineError;
use thiserror::Error;

use crate::collaborators::CollaboratorError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("session '{0}' already has a live channel")]
    SessionAlreadyActive(String),

    #[error("unknown session '{0}'")]
    UnknownSession(String),

    #[error("unknown or already resolved permission request '{0}'")]
    UnknownPermissionRequest(String),

    #[error("session '{0}' was closed while starting")]
    StartCancelled(String),

    #[error("session '{0}' no longer accepts input")]
    InputClosed(String),

    #[error("malformed '{kind}' envelope: {message}")]
    MalformedEnvelope { kind: String, message: String },

    #[error("unknown request type '{0}'")]
    UnknownRequestType(String),

    #[error("{0} is not configured")]
    MissingCollaborator(&'static str),

    #[error("transport closed")]
    TransportClosed,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

impl OrchestratorError {
    #[must_use]
    pub fn malformed(kind: impl Into<String>, message: impl ToString) -> Self {
        Self::MalformedEnvelope {
            kind: kind.into(),
            message: message.to_string(),
        }
    }

    /// Configuration problems surfaced by `start`; never retried.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::Engine(error) => error.is_configuration(),
            Self::Collaborator(CollaboratorError::Credentials(_)) => true,
            _ => false,
        }
    }
}
