//! Engine-agnostic contract for driving one agent conversation.
//!
//! This crate defines the wire event model emitted by an execution engine,
//! the query invocation contract (prompt source in, event source plus control
//! handle out), tool-authorization types, and the synchronous hook points run
//! between tool selection and tool execution. It excludes process transport
//! details and multi-session orchestration concerns.

mod error;
pub mod events;
pub mod hooks;
pub mod permission;
pub mod query;

pub use error::EngineError;
pub use events::{
    ApiMessage, AssistantEvent, ContentBlock, EngineEvent, MessageBody, ResultEvent,
    SystemEvent, ToolResultBlock, ToolUseBlock, Usage, UserEvent, UserTurn,
};
pub use hooks::{HookCallback, HookContext, HookDecision, HookPoint, Hooks};
pub use permission::{
    AllowAll, PermissionDecision, PermissionMode, ToolAuthorizer, ToolPermissionRequest,
};
pub use query::{EngineProfile, ExecutionEngine, Query, QueryControl, QueryOptions, QueryRequest};
pub use stream_channel::{ChannelError, ChannelReader, StreamChannel};
