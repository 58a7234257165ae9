use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use stream_channel::ChannelReader;

use crate::error::EngineError;
use crate::events::{EngineEvent, UserTurn};
use crate::hooks::Hooks;
use crate::permission::{PermissionMode, ToolAuthorizer};

/// Per-query engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    pub cwd: PathBuf,
    pub permission_mode: PermissionMode,
    pub model: Option<String>,
    /// Engine session id of a previous conversation to continue.
    pub resume: Option<String>,
    /// Environment overlay applied to the engine process.
    pub env: BTreeMap<String, String>,
}

impl QueryOptions {
    #[must_use]
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            permission_mode: PermissionMode::Default,
            model: None,
            resume: None,
            env: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    #[must_use]
    pub fn with_resume(mut self, resume: Option<String>) -> Self {
        self.resume = resume;
        self
    }

    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// Everything an engine needs to run one conversation.
pub struct QueryRequest {
    /// Local session id the query belongs to, used for logging.
    pub session_id: String,
    /// User turns, consumed in order until the source completes.
    pub prompt: ChannelReader<UserTurn>,
    pub options: QueryOptions,
    pub authorizer: Arc<dyn ToolAuthorizer>,
    pub hooks: Hooks,
}

impl fmt::Debug for QueryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRequest")
            .field("session_id", &self.session_id)
            .field("options", &self.options)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

/// Live control surface of a running query.
#[async_trait]
pub trait QueryControl: Send + Sync {
    /// Cooperatively stops the current turn. The query stays usable.
    async fn interrupt(&self) -> Result<(), EngineError>;

    async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), EngineError>;

    async fn set_model(&self, _model: Option<String>) -> Result<(), EngineError> {
        Err(EngineError::Unsupported("set_model"))
    }

    /// Forcefully terminates the query and releases its resources.
    fn close(&self);
}

/// A started query: the engine's event source plus its control handle.
pub struct Query {
    pub events: ChannelReader<EngineEvent>,
    pub control: Arc<dyn QueryControl>,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineProfile {
    pub engine_id: String,
    pub default_model: Option<String>,
}

/// Execution engine interface for starting conversations.
#[async_trait]
pub trait ExecutionEngine: Send + Sync + 'static {
    fn profile(&self) -> EngineProfile;

    /// Starts a query.
    ///
    /// Setup problems must be reported as [`EngineError::Configuration`]
    /// before any event is produced.
    async fn query(&self, request: QueryRequest) -> Result<Query, EngineError>;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use stream_channel::StreamChannel;

    use super::*;
    use crate::permission::AllowAll;

    struct EchoEngine;

    struct NoopControl {
        closed: AtomicBool,
    }

    #[async_trait]
    impl QueryControl for NoopControl {
        async fn interrupt(&self) -> Result<(), EngineError> {
            Ok(())
        }

        async fn set_permission_mode(&self, _mode: PermissionMode) -> Result<(), EngineError> {
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ExecutionEngine for EchoEngine {
        fn profile(&self) -> EngineProfile {
            EngineProfile {
                engine_id: "echo".to_string(),
                default_model: None,
            }
        }

        async fn query(&self, mut request: QueryRequest) -> Result<Query, EngineError> {
            let events = StreamChannel::new();
            let reader = events.reader()?;
            while let Some(turn) = request.prompt.next().await? {
                events.enqueue(EngineEvent::assistant(None, turn.content));
            }
            events.done();
            Ok(Query {
                events: reader,
                control: Arc::new(NoopControl {
                    closed: AtomicBool::new(false),
                }),
            })
        }
    }

    #[tokio::test]
    async fn engine_contract_is_object_safe_and_defaults_set_model() {
        let engine: Arc<dyn ExecutionEngine> = Arc::new(EchoEngine);
        let prompt = StreamChannel::new();
        prompt.enqueue(UserTurn::text("ping"));
        prompt.done();

        let mut query = engine
            .query(QueryRequest {
                session_id: "local".to_string(),
                prompt: prompt.reader().expect("prompt reader"),
                options: QueryOptions::new("/tmp").with_model(Some("m".to_string())),
                authorizer: Arc::new(AllowAll),
                hooks: Hooks::new(),
            })
            .await
            .expect("query starts");

        assert!(matches!(
            query.events.next().await,
            Ok(Some(EngineEvent::Assistant(_)))
        ));
        assert_eq!(query.events.next().await, Ok(None));
        assert_eq!(
            query.control.set_model(None).await,
            Err(EngineError::Unsupported("set_model"))
        );
        assert_eq!(engine.profile().engine_id, "echo");
    }
}
