use std::fmt;

use agent_engine::{ContentBlock, ToolResultBlock, ToolUseBlock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    User,
    Assistant,
    System,
    Result,
    Tip,
    SlashCommandResult,
}

impl Role {
    /// System and result messages drive state only and are never rendered.
    #[must_use]
    pub fn is_renderable(self) -> bool {
        !matches!(self, Self::System | Self::Result)
    }
}

/// One content block plus its reconciliation slots.
///
/// Owned by exactly one [`Message`]; intentionally not `Clone`, since the
/// observable tool-result slot carries live subscriptions.
pub struct ContentBlockWrapper {
    block: ContentBlock,
    tool_result: Signal<Option<ToolResultBlock>>,
    extended_result: Option<Value>,
}

impl fmt::Debug for ContentBlockWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentBlockWrapper")
            .field("block", &self.block)
            .field("tool_result", &self.tool_result)
            .field("extended_result", &self.extended_result)
            .finish()
    }
}

impl ContentBlockWrapper {
    #[must_use]
    pub fn new(block: ContentBlock) -> Self {
        Self {
            block,
            tool_result: Signal::new(None),
            extended_result: None,
        }
    }

    #[must_use]
    pub fn block(&self) -> &ContentBlock {
        &self.block
    }

    #[must_use]
    pub fn tool_use(&self) -> Option<&ToolUseBlock> {
        self.block.as_tool_use()
    }

    /// Current value of the associated tool result slot.
    #[must_use]
    pub fn tool_result(&self) -> Option<ToolResultBlock> {
        self.tool_result.get()
    }

    /// Observable slot; subscribe to be told when a result is associated.
    #[must_use]
    pub fn tool_result_signal(&self) -> &Signal<Option<ToolResultBlock>> {
        &self.tool_result
    }

    pub fn set_tool_result(&self, result: ToolResultBlock) {
        self.tool_result.set(Some(result));
    }

    #[must_use]
    pub fn extended_result(&self) -> Option<&Value> {
        self.extended_result.as_ref()
    }

    pub fn set_extended_result(&mut self, value: Value) {
        self.extended_result = Some(value);
    }

    /// Copies the block and current slot values into a fresh wrapper with
    /// no subscribers.
    #[must_use]
    pub fn detached_copy(&self) -> Self {
        let copy = Self::new(self.block.clone());
        if let Some(result) = self.tool_result() {
            copy.set_tool_result(result);
        }
        Self {
            extended_result: self.extended_result.clone(),
            ..copy
        }
    }
}

#[derive(Debug)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlockWrapper>),
}

#[derive(Debug)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    pub timestamp: OffsetDateTime,
    /// Engine message id, when the engine reported one.
    pub id: Option<String>,
}

impl Message {
    #[must_use]
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
            timestamp: OffsetDateTime::now_utc(),
            id: None,
        }
    }

    #[must_use]
    pub fn blocks(role: Role, blocks: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content: MessageContent::Blocks(
                blocks.into_iter().map(ContentBlockWrapper::new).collect(),
            ),
            timestamp: OffsetDateTime::now_utc(),
            id: None,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    /// Block wrappers; a plain-text message has none.
    #[must_use]
    pub fn wrappers(&self) -> &[ContentBlockWrapper] {
        match &self.content {
            MessageContent::Text(_) => &[],
            MessageContent::Blocks(blocks) => blocks,
        }
    }

    pub fn wrappers_mut(&mut self) -> &mut [ContentBlockWrapper] {
        match &mut self.content {
            MessageContent::Text(_) => &mut [],
            MessageContent::Blocks(blocks) => blocks,
        }
    }

    /// True when there is nothing to render.
    ///
    /// System messages are never considered empty. Otherwise a message is
    /// empty when its text is empty, it has no blocks, or every block is a
    /// tool result.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        if self.role == Role::System {
            return false;
        }
        match &self.content {
            MessageContent::Text(text) => text.is_empty(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .all(|wrapper| wrapper.block().is_tool_result()),
        }
    }

    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.role.is_renderable() && !self.is_empty()
    }

    /// Concatenated text of plain content or text blocks.
    #[must_use]
    pub fn plain_text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|wrapper| match wrapper.block() {
                    ContentBlock::Text { text } | ContentBlock::Interrupt { text } => {
                        Some(text.as_str())
                    }
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    #[must_use]
    pub fn detached_copy(&self) -> Self {
        let content = match &self.content {
            MessageContent::Text(text) => MessageContent::Text(text.clone()),
            MessageContent::Blocks(blocks) => MessageContent::Blocks(
                blocks.iter().map(ContentBlockWrapper::detached_copy).collect(),
            ),
        };
        Self {
            role: self.role,
            content,
            timestamp: self.timestamp,
            id: self.id.clone(),
        }
    }
}
