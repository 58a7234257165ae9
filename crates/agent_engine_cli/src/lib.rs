//! Execution engine backed by the external agent executable.
//!
//! The agent runs as a child process speaking newline-delimited stream-JSON
//! on stdio: user turns and control messages go to stdin, engine events and
//! control requests come back on stdout.

mod config;
mod engine;
mod error;
pub mod ndjson;
pub mod protocol;

pub use config::{CliEngineConfig, CLI_ENGINE_ID, DEFAULT_AGENT_EXECUTABLE};
pub use engine::CliEngine;
pub use error::CliEngineError;
pub use ndjson::{InboundFrame, NdjsonParser};
pub use protocol::ControlRequest;
