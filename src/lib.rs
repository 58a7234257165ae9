//! Stdio host for the session orchestrator.
//!
//! Reads request envelopes as JSON lines on stdin, writes responses and
//! session events as JSON lines on stdout, and logs to stderr.

pub mod app;
pub mod config;
pub mod error;
pub mod logging;
pub mod stdio_transport;

pub use app::{build_orchestrator, engine_for_id, run, DEFAULT_ENGINE_ID};
pub use config::EnvConfig;
pub use error::BridgeError;
pub use stdio_transport::{StdioTasks, StdioTransport};
