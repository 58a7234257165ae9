use agent_engine::{ApiMessage, AssistantEvent, EngineEvent, UserEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One line of an engine transcript log.
///
/// Only the fields reconciliation needs are read; everything else on the
/// line is ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub is_sidechain: bool,
    #[serde(default)]
    pub is_meta: bool,
    #[serde(default)]
    pub message: Option<ApiMessage>,
    #[serde(default)]
    pub tool_use_result: Option<Value>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl LogRecord {
    /// True for lines that belong to the main conversation.
    #[must_use]
    pub fn is_conversation(&self) -> bool {
        matches!(self.kind.as_str(), "user" | "assistant") && !self.is_sidechain && !self.is_meta
    }
}

/// A conversation event recovered from a log, ready to replay through a
/// transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalEvent {
    pub event: EngineEvent,
    #[serde(
        default,
        rename = "toolUseResult",
        skip_serializing_if = "Option::is_none"
    )]
    pub tool_use_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl HistoricalEvent {
    pub(crate) fn from_record(record: LogRecord, message: ApiMessage) -> Self {
        let event = if record.kind == "assistant" {
            EngineEvent::Assistant(AssistantEvent {
                message,
                session_id: record.session_id,
                parent_tool_use_id: None,
                uuid: record.uuid,
            })
        } else {
            EngineEvent::User(UserEvent {
                message,
                session_id: record.session_id,
                parent_tool_use_id: None,
                uuid: record.uuid,
                tool_use_result: record.tool_use_result.clone(),
            })
        };

        Self {
            event,
            tool_use_result: record.tool_use_result,
            timestamp: record.timestamp,
        }
    }
}
