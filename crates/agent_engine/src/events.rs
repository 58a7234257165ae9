//! Wire event model emitted by an execution engine.
//!
//! Shapes follow the engine's stream-JSON output: one JSON object per event,
//! discriminated by `type`, with message content as either a plain string or
//! an ordered list of typed content blocks.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::permission::PermissionMode;

/// One raw event produced by an execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    System(SystemEvent),
    Assistant(AssistantEvent),
    User(UserEvent),
    Result(ResultEvent),
}

impl EngineEvent {
    /// Returns the engine session id carried by the event, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::System(event) => event.session_id.as_deref(),
            Self::Assistant(event) => event.session_id.as_deref(),
            Self::User(event) => event.session_id.as_deref(),
            Self::Result(event) => event.session_id.as_deref(),
        }
    }

    /// Returns true when this event ends the current turn.
    #[must_use]
    pub fn is_turn_end(&self) -> bool {
        matches!(self, Self::Result(_))
    }

    /// Builds a `system/init` event.
    #[must_use]
    pub fn init(
        session_id: impl Into<String>,
        cwd: impl Into<String>,
        model: Option<String>,
        permission_mode: PermissionMode,
    ) -> Self {
        Self::System(SystemEvent {
            subtype: "init".to_string(),
            session_id: Some(session_id.into()),
            cwd: Some(cwd.into()),
            model,
            permission_mode: Some(permission_mode),
            tools: Vec::new(),
        })
    }

    /// Builds an assistant event from content blocks.
    #[must_use]
    pub fn assistant(session_id: Option<String>, content: Vec<ContentBlock>) -> Self {
        Self::Assistant(AssistantEvent {
            message: ApiMessage::blocks(content),
            session_id,
            parent_tool_use_id: None,
            uuid: None,
        })
    }

    /// Builds a user event from content blocks.
    #[must_use]
    pub fn user(session_id: Option<String>, content: Vec<ContentBlock>) -> Self {
        Self::User(UserEvent {
            message: ApiMessage::blocks(content),
            session_id,
            parent_tool_use_id: None,
            uuid: None,
            tool_use_result: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub subtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(
        default,
        rename = "permissionMode",
        skip_serializing_if = "Option::is_none"
    )]
    pub permission_mode: Option<PermissionMode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

impl SystemEvent {
    #[must_use]
    pub fn is_init(&self) -> bool {
        self.subtype == "init"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantEvent {
    pub message: ApiMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEvent {
    pub message: ApiMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Rich tool output recorded next to the tool result in transcript logs.
    #[serde(
        default,
        rename = "toolUseResult",
        skip_serializing_if = "Option::is_none"
    )]
    pub tool_use_result: Option<Value>,
}

/// Turn summary emitted when the engine finishes processing one user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEvent {
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ResultEvent {
    #[must_use]
    pub fn success(session_id: Option<String>, result: impl Into<String>) -> Self {
        Self {
            subtype: "success".to_string(),
            is_error: false,
            result: Some(result.into()),
            session_id,
            duration_ms: None,
            num_turns: Some(1),
            total_cost_usd: None,
            usage: None,
        }
    }
}

/// Token counters reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl Usage {
    pub fn accumulate(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub content: MessageBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ApiMessage {
    #[must_use]
    pub fn blocks(content: Vec<ContentBlock>) -> Self {
        Self {
            id: None,
            role: None,
            content: MessageBody::Blocks(content),
            model: None,
            usage: None,
        }
    }
}

/// Message content: either a bare string or typed blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageBody {
    /// Iterates over the blocks; a bare string yields nothing.
    pub fn iter_blocks(&self) -> impl Iterator<Item = &ContentBlock> {
        let blocks: &[ContentBlock] = match self {
            Self::Text(_) => &[],
            Self::Blocks(blocks) => blocks,
        };
        blocks.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultBlock),
    Image {
        source: Value,
    },
    /// Local marker for a turn the user interrupted. Never sent by engines.
    Interrupt {
        text: String,
    },
    #[serde(other)]
    Unknown,
}

impl ContentBlock {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    #[must_use]
    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::ToolUse(ToolUseBlock {
            id: id.into(),
            name: name.into(),
            input,
        })
    }

    #[must_use]
    pub fn as_tool_use(&self) -> Option<&ToolUseBlock> {
        match self {
            Self::ToolUse(block) => Some(block),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_tool_result(&self) -> Option<&ToolResultBlock> {
        match self {
            Self::ToolResult(block) => Some(block),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_tool_result(&self) -> bool {
        matches!(self, Self::ToolResult(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseBlock {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResultBlock {
    #[must_use]
    pub fn success(tool_use_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: Value::String(text.into()),
            is_error: false,
        }
    }

    #[must_use]
    pub fn error(tool_use_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: Value::String(text.into()),
            is_error: true,
        }
    }

    /// Flattens the result content to text.
    ///
    /// Content is either a string or a list of `{type: "text", text}` parts;
    /// non-text parts are skipped.
    #[must_use]
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// One user turn pushed into an engine's prompt source.
#[derive(Debug, Clone, PartialEq)]
pub struct UserTurn {
    pub content: Vec<ContentBlock>,
}

impl UserTurn {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
        }
    }

    /// Concatenated text of all text blocks.
    #[must_use]
    pub fn plain_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
