//! UI-facing envelope protocol.
//!
//! Every message is `{ "type", "requestId"?, "payload" }`. A request of type
//! `X` is answered by exactly one `X_response` carrying the same request id;
//! server events carry no request id.

use std::path::PathBuf;

use agent_engine::{EngineEvent, PermissionDecision, PermissionMode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::collaborators::AssetKind;
use crate::error::OrchestratorError;
use crate::permissions::PermissionRequest;

pub const RESPONSE_SUFFIX: &str = "_response";
pub const DEFAULT_SEARCH_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default = "empty_object")]
    pub payload: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Envelope {
    #[must_use]
    pub fn new(kind: impl Into<String>, request_id: Option<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            request_id,
            payload,
        }
    }

    /// Successful answer to a request of type `request_kind`; `fields` are
    /// merged next to `success: true`.
    #[must_use]
    pub fn success(request_kind: &str, request_id: Option<String>, fields: Value) -> Self {
        let mut payload = match fields {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("result".to_string(), other);
                map
            }
        };
        payload.insert("success".to_string(), Value::Bool(true));
        Self::new(
            format!("{request_kind}{RESPONSE_SUFFIX}"),
            request_id,
            Value::Object(payload),
        )
    }

    #[must_use]
    pub fn failure(request_kind: &str, request_id: Option<String>, error: impl ToString) -> Self {
        Self::new(
            format!("{request_kind}{RESPONSE_SUFFIX}"),
            request_id,
            json!({ "success": false, "error": error.to_string() }),
        )
    }

    #[must_use]
    pub fn is_response(&self) -> bool {
        self.kind.ends_with(RESPONSE_SUFFIX)
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.payload
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.payload.get("error").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionParams {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<PermissionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageParams {
    pub session_id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionParams {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPermissionModeParams {
    pub session_id: String,
    pub mode: PermissionMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetModelParams {
    pub session_id: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResponseParams {
    pub id: String,
    pub decision: PermissionDecision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListAssetsParams {
    pub kind: AssetKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilesParams {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
}

fn default_search_limit() -> usize {
    DEFAULT_SEARCH_LIMIT
}

/// A decoded UI request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    StartSession(StartSessionParams),
    SendMessage(SendMessageParams),
    Interrupt(SessionParams),
    CloseSession(SessionParams),
    SetPermissionMode(SetPermissionModeParams),
    SetModel(SetModelParams),
    PermissionResponse(PermissionResponseParams),
    ListSessions,
    LoadSession(SessionParams),
    ListAssets(ListAssetsParams),
    SearchFiles(SearchFilesParams),
    GetActiveProvider,
}

impl Request {
    pub const START_SESSION: &'static str = "start_session";
    pub const SEND_MESSAGE: &'static str = "send_message";
    pub const INTERRUPT: &'static str = "interrupt";
    pub const CLOSE_SESSION: &'static str = "close_session";
    pub const SET_PERMISSION_MODE: &'static str = "set_permission_mode";
    pub const SET_MODEL: &'static str = "set_model";
    pub const PERMISSION_RESPONSE: &'static str = "permission_response";
    pub const LIST_SESSIONS: &'static str = "list_sessions";
    pub const LOAD_SESSION: &'static str = "load_session";
    pub const LIST_ASSETS: &'static str = "list_assets";
    pub const SEARCH_FILES: &'static str = "search_files";
    pub const GET_ACTIVE_PROVIDER: &'static str = "get_active_provider";

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartSession(_) => Self::START_SESSION,
            Self::SendMessage(_) => Self::SEND_MESSAGE,
            Self::Interrupt(_) => Self::INTERRUPT,
            Self::CloseSession(_) => Self::CLOSE_SESSION,
            Self::SetPermissionMode(_) => Self::SET_PERMISSION_MODE,
            Self::SetModel(_) => Self::SET_MODEL,
            Self::PermissionResponse(_) => Self::PERMISSION_RESPONSE,
            Self::ListSessions => Self::LIST_SESSIONS,
            Self::LoadSession(_) => Self::LOAD_SESSION,
            Self::ListAssets(_) => Self::LIST_ASSETS,
            Self::SearchFiles(_) => Self::SEARCH_FILES,
            Self::GetActiveProvider => Self::GET_ACTIVE_PROVIDER,
        }
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, OrchestratorError> {
        let kind = envelope.kind.as_str();
        let request = match kind {
            Self::START_SESSION => Self::StartSession(params(envelope)?),
            Self::SEND_MESSAGE => Self::SendMessage(params(envelope)?),
            Self::INTERRUPT => Self::Interrupt(params(envelope)?),
            Self::CLOSE_SESSION => Self::CloseSession(params(envelope)?),
            Self::SET_PERMISSION_MODE => Self::SetPermissionMode(params(envelope)?),
            Self::SET_MODEL => Self::SetModel(params(envelope)?),
            Self::PERMISSION_RESPONSE => Self::PermissionResponse(params(envelope)?),
            Self::LIST_SESSIONS => Self::ListSessions,
            Self::LOAD_SESSION => Self::LoadSession(params(envelope)?),
            Self::LIST_ASSETS => Self::ListAssets(params(envelope)?),
            Self::SEARCH_FILES => Self::SearchFiles(params(envelope)?),
            Self::GET_ACTIVE_PROVIDER => Self::GetActiveProvider,
            other => return Err(OrchestratorError::UnknownRequestType(other.to_string())),
        };
        Ok(request)
    }

    /// Encodes the request for sending; used by clients.
    pub fn to_envelope(
        &self,
        request_id: impl Into<String>,
    ) -> Result<Envelope, serde_json::Error> {
        let payload = match self {
            Self::StartSession(params) => serde_json::to_value(params)?,
            Self::SendMessage(params) => serde_json::to_value(params)?,
            Self::Interrupt(params) | Self::CloseSession(params) | Self::LoadSession(params) => {
                serde_json::to_value(params)?
            }
            Self::SetPermissionMode(params) => serde_json::to_value(params)?,
            Self::SetModel(params) => serde_json::to_value(params)?,
            Self::PermissionResponse(params) => serde_json::to_value(params)?,
            Self::ListAssets(params) => serde_json::to_value(params)?,
            Self::SearchFiles(params) => serde_json::to_value(params)?,
            Self::ListSessions | Self::GetActiveProvider => empty_object(),
        };
        Ok(Envelope::new(self.kind(), Some(request_id.into()), payload))
    }

    /// Requests whose effects must apply in arrival order. The rest may wait
    /// on the engine or on disk and run off the dispatch loop.
    #[must_use]
    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            Self::StartSession(_)
                | Self::SendMessage(_)
                | Self::CloseSession(_)
                | Self::PermissionResponse(_)
        )
    }
}

fn params<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, OrchestratorError> {
    serde_json::from_value(envelope.payload.clone())
        .map_err(|error| OrchestratorError::malformed(&envelope.kind, error))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The engine finished its event stream.
    Completed,
    Closed,
    CredentialChange,
    Error,
}

/// Server-pushed events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    SessionEvent {
        session_id: String,
        event: EngineEvent,
    },
    PermissionRequest(PermissionRequest),
    PermissionResolved {
        session_id: String,
        id: String,
        allowed: bool,
    },
    SessionError {
        session_id: String,
        error: String,
    },
    SessionClosed {
        session_id: String,
        reason: CloseReason,
    },
}

impl ServerEvent {
    pub const KINDS: [&'static str; 5] = [
        "session_event",
        "permission_request",
        "permission_resolved",
        "session_error",
        "session_closed",
    ];

    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionEvent { session_id, .. }
            | Self::PermissionResolved { session_id, .. }
            | Self::SessionError { session_id, .. }
            | Self::SessionClosed { session_id, .. } => session_id,
            Self::PermissionRequest(request) => &request.session_id,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, serde_json::Error> {
        let mut tagged = serde_json::to_value(self)?;
        let kind = tagged
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let payload = tagged
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or_else(empty_object);
        Ok(Envelope::new(kind, None, payload))
    }

    /// Decodes an event envelope; `Ok(None)` for envelopes that are not
    /// server events.
    pub fn from_envelope(envelope: &Envelope) -> Result<Option<Self>, serde_json::Error> {
        if !Self::KINDS.contains(&envelope.kind.as_str()) {
            return Ok(None);
        }
        serde_json::from_value(json!({
            "type": envelope.kind,
            "payload": envelope.payload,
        }))
        .map(Some)
    }
}
