//! Outbound stdin messages and control payloads.

use agent_engine::{PermissionDecision, PermissionMode, ToolPermissionRequest, UserTurn};
use serde::Serialize;
use serde_json::{json, Value};

/// Control request the host sends to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlRequest {
    Interrupt,
    SetPermissionMode { mode: PermissionMode },
    SetModel { model: Option<String> },
}

impl ControlRequest {
    #[must_use]
    pub fn subtype(&self) -> &'static str {
        match self {
            Self::Interrupt => "interrupt",
            Self::SetPermissionMode { .. } => "set_permission_mode",
            Self::SetModel { .. } => "set_model",
        }
    }
}

pub fn user_message_line(
    turn: &UserTurn,
    session_id: Option<&str>,
) -> Result<String, serde_json::Error> {
    line(&json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": turn.content,
        },
        "parent_tool_use_id": null,
        "session_id": session_id.unwrap_or("default"),
    }))
}

pub fn control_request_line(
    request_id: &str,
    request: &ControlRequest,
) -> Result<String, serde_json::Error> {
    line(&json!({
        "type": "control_request",
        "request_id": request_id,
        "request": request,
    }))
}

pub fn permission_response_line(
    request_id: &str,
    decision: &PermissionDecision,
) -> Result<String, serde_json::Error> {
    line(&json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": decision,
        },
    }))
}

pub fn control_error_line(request_id: &str, message: &str) -> Result<String, serde_json::Error> {
    line(&json!({
        "type": "control_response",
        "response": {
            "subtype": "error",
            "request_id": request_id,
            "error": message,
        },
    }))
}

/// Extracts a tool authorization request from a `can_use_tool` control
/// request body. Other subtypes yield `None`.
pub fn parse_can_use_tool(request: &Value) -> Option<ToolPermissionRequest> {
    if request.get("subtype").and_then(Value::as_str) != Some("can_use_tool") {
        return None;
    }

    Some(ToolPermissionRequest {
        tool_name: request.get("tool_name")?.as_str()?.to_string(),
        input: request.get("input").cloned().unwrap_or(Value::Null),
        suggestions: request
            .get("permission_suggestions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        tool_use_id: request
            .get("tool_use_id")
            .and_then(Value::as_str)
            .map(ToString::to_string),
    })
}

fn line(value: &Value) -> Result<String, serde_json::Error> {
    let mut encoded = serde_json::to_string(value)?;
    encoded.push('\n');
    Ok(encoded)
}
