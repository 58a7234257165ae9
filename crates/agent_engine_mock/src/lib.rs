//! Deterministic scripted implementation of the `agent_engine` contract.
//!
//! This crate contains no process or protocol logic and is intended for local
//! development and contract-level integration testing.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use agent_engine::{
    ChannelError, ChannelReader, ContentBlock, EngineError, EngineEvent, EngineProfile,
    ExecutionEngine, HookContext, HookDecision, HookPoint, Hooks, PermissionDecision,
    PermissionMode, Query, QueryControl, QueryRequest, ResultEvent, StreamChannel,
    ToolAuthorizer, ToolPermissionRequest, ToolResultBlock, Usage, UserTurn,
};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

/// Stable engine identifier used for explicit startup selection.
pub const MOCK_ENGINE_ID: &str = "mock";

/// Text the engine emits when a turn is interrupted.
pub const INTERRUPT_MARKER: &str = "[Request interrupted by user]";
pub const TOOL_INTERRUPT_MARKER: &str = "[Request interrupted by user for tool use]";

/// One step played for every user turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    Text(String),
    Thinking(String),
    /// A tool call that goes through hooks and authorization, then succeeds
    /// with `output` when allowed.
    ToolCall {
        name: String,
        input: Value,
        output: String,
    },
    /// A tool call whose execution fails with `error` when allowed.
    FailingToolCall {
        name: String,
        input: Value,
        error: String,
    },
}

impl ScriptStep {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    #[must_use]
    pub fn tool_call(name: impl Into<String>, input: Value, output: impl Into<String>) -> Self {
        Self::ToolCall {
            name: name.into(),
            input,
            output: output.into(),
        }
    }
}

/// Scripted engine used by orchestrator tests and local runs.
#[derive(Debug)]
pub struct ScriptedEngine {
    script: Arc<Vec<ScriptStep>>,
    default_model: String,
    step_delay: Duration,
    next_session: AtomicU64,
}

impl ScriptedEngine {
    #[must_use]
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self {
            script: Arc::new(script),
            default_model: "mock".to_string(),
            step_delay: Duration::ZERO,
            next_session: AtomicU64::new(1),
        }
    }

    /// Pauses before every step, which makes interrupts observable mid-turn.
    #[must_use]
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    #[must_use]
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !model.trim().is_empty() {
            self.default_model = model.trim().to_string();
        }
        self
    }
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new(vec![
            ScriptStep::text("Looking at the project layout."),
            ScriptStep::tool_call(
                "Read",
                serde_json::json!({ "file_path": "Cargo.toml" }),
                "[workspace]\nmembers = [\"crates/*\"]\n",
            ),
            ScriptStep::tool_call(
                "Read",
                serde_json::json!({ "file_path": "README.md" }),
                "# Project\n",
            ),
            ScriptStep::text("Done reading. Everything looks in order."),
        ])
    }
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    fn profile(&self) -> EngineProfile {
        EngineProfile {
            engine_id: MOCK_ENGINE_ID.to_string(),
            default_model: Some(self.default_model.clone()),
        }
    }

    async fn query(&self, request: QueryRequest) -> Result<Query, EngineError> {
        if !request.options.cwd.is_absolute() {
            return Err(EngineError::configuration(format!(
                "working directory must be absolute: {}",
                request.options.cwd.display()
            )));
        }

        let engine_session_id = request.options.resume.clone().unwrap_or_else(|| {
            format!(
                "mock-session-{}",
                self.next_session.fetch_add(1, Ordering::Relaxed)
            )
        });
        let model = request
            .options
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        let events = StreamChannel::new();
        let reader = events.reader()?;
        let control = Arc::new(MockControl {
            events: events.clone(),
            interrupted: AtomicBool::new(false),
            interrupt_signal: Notify::new(),
            permission_mode: Mutex::new(request.options.permission_mode),
            model: Mutex::new(model.clone()),
        });

        events.enqueue(EngineEvent::init(
            engine_session_id.clone(),
            request.options.cwd.display().to_string(),
            Some(model),
            request.options.permission_mode,
        ));

        let run = ScriptRun {
            script: Arc::clone(&self.script),
            step_delay: self.step_delay,
            session_id: engine_session_id,
            authorizer: request.authorizer,
            hooks: request.hooks,
            control: Arc::clone(&control),
        };
        let task = tokio::spawn(run.drive(request.prompt));
        let abort = task.abort_handle();
        events.set_cleanup(move || abort.abort());

        Ok(Query {
            events: reader,
            control,
        })
    }
}

struct MockControl {
    events: StreamChannel<EngineEvent>,
    interrupted: AtomicBool,
    interrupt_signal: Notify,
    permission_mode: Mutex<PermissionMode>,
    model: Mutex<String>,
}

impl MockControl {
    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    async fn wait_for_interrupt(&self) {
        loop {
            let notified = self.interrupt_signal.notified();
            if self.is_interrupted() {
                return;
            }
            notified.await;
        }
    }

    fn permission_mode(&self) -> PermissionMode {
        *lock_unpoisoned(&self.permission_mode)
    }
}

#[async_trait]
impl QueryControl for MockControl {
    async fn interrupt(&self) -> Result<(), EngineError> {
        if self.events.is_done() {
            return Err(EngineError::Closed);
        }
        self.interrupted.store(true, Ordering::SeqCst);
        self.interrupt_signal.notify_waiters();
        Ok(())
    }

    async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), EngineError> {
        *lock_unpoisoned(&self.permission_mode) = mode;
        Ok(())
    }

    async fn set_model(&self, model: Option<String>) -> Result<(), EngineError> {
        if let Some(model) = model {
            *lock_unpoisoned(&self.model) = model;
        }
        Ok(())
    }

    fn close(&self) {
        self.events.close();
    }
}

enum TurnOutcome {
    Completed,
    Interrupted { marker: &'static str },
    Stopped { reason: String },
}

struct ScriptRun {
    script: Arc<Vec<ScriptStep>>,
    step_delay: Duration,
    session_id: String,
    authorizer: Arc<dyn ToolAuthorizer>,
    hooks: Hooks,
    control: Arc<MockControl>,
}

impl ScriptRun {
    async fn drive(self, mut prompt: ChannelReader<UserTurn>) {
        let mut turn_index = 0usize;
        loop {
            match prompt.next().await {
                Ok(Some(_turn)) => {
                    turn_index += 1;
                    self.control.interrupted.store(false, Ordering::SeqCst);
                    let outcome = self.play_turn(turn_index).await;
                    self.finish_turn(turn_index, outcome);
                }
                Ok(None) => {
                    self.control.events.done();
                    return;
                }
                Err(error) => {
                    self.control
                        .events
                        .error(ChannelError::failed(format!("prompt source failed: {error}")));
                    return;
                }
            }
        }
    }

    async fn play_turn(&self, turn_index: usize) -> TurnOutcome {
        for (step_index, step) in self.script.iter().enumerate() {
            if !self.pause().await {
                return TurnOutcome::Interrupted {
                    marker: INTERRUPT_MARKER,
                };
            }

            match step {
                ScriptStep::Text(text) => self.emit_assistant(ContentBlock::text(text.clone())),
                ScriptStep::Thinking(thinking) => self.emit_assistant(ContentBlock::Thinking {
                    thinking: thinking.clone(),
                    signature: None,
                }),
                ScriptStep::ToolCall {
                    name,
                    input,
                    output,
                } => {
                    let id = format!("toolu_mock_{turn_index}_{step_index}");
                    let outcome = self.run_tool(&id, name, input, Ok(output)).await;
                    if let Some(outcome) = outcome {
                        return outcome;
                    }
                }
                ScriptStep::FailingToolCall { name, input, error } => {
                    let id = format!("toolu_mock_{turn_index}_{step_index}");
                    let outcome = self.run_tool(&id, name, input, Err(error)).await;
                    if let Some(outcome) = outcome {
                        return outcome;
                    }
                }
            }
        }

        TurnOutcome::Completed
    }

    /// Plays one tool call. Returns an outcome when the turn must end early.
    async fn run_tool(
        &self,
        id: &str,
        name: &str,
        input: &Value,
        execution: Result<&String, &String>,
    ) -> Option<TurnOutcome> {
        self.emit_assistant(ContentBlock::tool_use(id, name, input.clone()));

        let pre = self.hooks.run(&HookContext {
            point: HookPoint::PreToolUse,
            tool_name: name,
            input,
            tool_use_id: Some(id),
            result: None,
        });
        if let HookDecision::Block { reason } = pre {
            self.emit_tool_result(ToolResultBlock::error(id, reason));
            if self.control.is_interrupted() {
                return Some(TurnOutcome::Interrupted {
                    marker: TOOL_INTERRUPT_MARKER,
                });
            }
            return None;
        }

        if self.control.permission_mode() != PermissionMode::BypassPermissions {
            let request = ToolPermissionRequest {
                tool_name: name.to_string(),
                input: input.clone(),
                suggestions: Vec::new(),
                tool_use_id: Some(id.to_string()),
            };
            let decision = tokio::select! {
                decision = self.authorizer.authorize(request) => decision,
                _ = self.control.wait_for_interrupt() => {
                    self.emit_tool_result(ToolResultBlock::error(id, TOOL_INTERRUPT_MARKER));
                    return Some(TurnOutcome::Interrupted { marker: TOOL_INTERRUPT_MARKER });
                }
            };

            if let PermissionDecision::Deny { message, interrupt } = decision {
                self.emit_tool_result(ToolResultBlock::error(id, message));
                if interrupt {
                    return Some(TurnOutcome::Interrupted {
                        marker: TOOL_INTERRUPT_MARKER,
                    });
                }
                return None;
            }
        }

        let result = match execution {
            Ok(output) => ToolResultBlock::success(id, output.clone()),
            Err(error) => ToolResultBlock::error(id, error.clone()),
        };
        let post = self.hooks.run(&HookContext {
            point: HookPoint::PostToolUse,
            tool_name: name,
            input,
            tool_use_id: Some(id),
            result: Some(&result),
        });
        self.emit_tool_result(result);

        match post {
            HookDecision::Continue => None,
            HookDecision::Block { reason } => Some(TurnOutcome::Stopped { reason }),
        }
    }

    /// Waits the configured step delay. Returns false when interrupted.
    async fn pause(&self) -> bool {
        if self.control.is_interrupted() {
            return false;
        }
        if self.step_delay.is_zero() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.step_delay) => !self.control.is_interrupted(),
            _ = self.control.wait_for_interrupt() => false,
        }
    }

    fn finish_turn(&self, turn_index: usize, outcome: TurnOutcome) {
        let text = match outcome {
            TurnOutcome::Completed => "completed".to_string(),
            TurnOutcome::Interrupted { marker } => {
                self.emit_user(ContentBlock::text(marker));
                "interrupted".to_string()
            }
            TurnOutcome::Stopped { reason } => {
                self.emit_assistant(ContentBlock::text(format!("Stopped: {reason}")));
                "stopped".to_string()
            }
        };

        let mut result = ResultEvent::success(Some(self.session_id.clone()), text);
        result.num_turns = Some(turn_index as u32);
        result.usage = Some(Usage {
            input_tokens: 10,
            output_tokens: 5,
            ..Usage::default()
        });
        result.total_cost_usd = Some(0.001);
        self.control.events.enqueue(EngineEvent::Result(result));
    }

    fn emit_assistant(&self, block: ContentBlock) {
        self.control
            .events
            .enqueue(EngineEvent::assistant(Some(self.session_id.clone()), vec![block]));
    }

    fn emit_user(&self, block: ContentBlock) {
        self.control
            .events
            .enqueue(EngineEvent::user(Some(self.session_id.clone()), vec![block]));
    }

    fn emit_tool_result(&self, result: ToolResultBlock) {
        self.emit_user(ContentBlock::ToolResult(result));
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use agent_engine::{AllowAll, QueryOptions};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    struct DenyWith {
        interrupt: bool,
    }

    #[async_trait]
    impl ToolAuthorizer for DenyWith {
        async fn authorize(&self, _request: ToolPermissionRequest) -> PermissionDecision {
            PermissionDecision::deny("user said no", self.interrupt)
        }
    }

    fn request(
        prompt: &StreamChannel<UserTurn>,
        authorizer: Arc<dyn ToolAuthorizer>,
        hooks: Hooks,
    ) -> QueryRequest {
        QueryRequest {
            session_id: "local-1".to_string(),
            prompt: prompt.reader().expect("prompt reader"),
            options: QueryOptions::new(PathBuf::from("/work")),
            authorizer,
            hooks,
        }
    }

    async fn collect(mut query: Query) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Some(event) = query.events.next().await.expect("no stream failure") {
            events.push(event);
        }
        events
    }

    fn tool_results(events: &[EngineEvent]) -> Vec<ToolResultBlock> {
        events
            .iter()
            .filter_map(|event| match event {
                EngineEvent::User(user) => user
                    .message
                    .content
                    .iter_blocks()
                    .find_map(ContentBlock::as_tool_result)
                    .cloned(),
                _ => None,
            })
            .collect()
    }

    /// Whether a user or assistant event carries exactly this text block.
    fn says(event: &EngineEvent, text: &str) -> bool {
        let content = match event {
            EngineEvent::User(user) => &user.message.content,
            EngineEvent::Assistant(assistant) => &assistant.message.content,
            _ => return false,
        };
        content
            .iter_blocks()
            .any(|block| block == &ContentBlock::text(text))
    }

    #[test]
    fn profile_exposes_mock_identity() {
        let profile = ScriptedEngine::new(Vec::new())
            .with_default_model("  ")
            .profile();

        assert_eq!(profile.engine_id, MOCK_ENGINE_ID);
        assert_eq!(profile.default_model.as_deref(), Some("mock"));
    }

    #[tokio::test]
    async fn turn_plays_script_and_ends_with_result() {
        let engine = ScriptedEngine::default();
        let prompt = StreamChannel::new();
        prompt.enqueue(UserTurn::text("look around"));
        prompt.done();

        let query = engine
            .query(request(&prompt, Arc::new(AllowAll), Hooks::new()))
            .await
            .expect("query starts");
        let events = collect(query).await;

        assert!(matches!(&events[0], EngineEvent::System(system) if system.is_init()));
        assert!(events.last().is_some_and(EngineEvent::is_turn_end));
        let results = tool_results(&events);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|result| !result.is_error));
    }

    #[tokio::test]
    async fn resume_token_becomes_engine_session_id() {
        let engine = ScriptedEngine::new(Vec::new());
        let prompt = StreamChannel::new();
        prompt.done();
        let mut req = request(&prompt, Arc::new(AllowAll), Hooks::new());
        req.options = req.options.with_resume(Some("resume-me".to_string()));

        let events = collect(engine.query(req).await.expect("query starts")).await;

        assert_eq!(events[0].session_id(), Some("resume-me"));
    }

    #[tokio::test]
    async fn relative_cwd_is_a_configuration_error() {
        let engine = ScriptedEngine::default();
        let prompt = StreamChannel::new();
        let mut req = request(&prompt, Arc::new(AllowAll), Hooks::new());
        req.options.cwd = PathBuf::from("relative/dir");

        let error = engine.query(req).await.expect_err("query must fail");
        assert!(error.is_configuration());
    }

    #[tokio::test]
    async fn deny_with_interrupt_ends_turn_with_marker() {
        let engine = ScriptedEngine::new(vec![
            ScriptStep::tool_call("Bash", json!({"command": "rm -rf /"}), "never"),
            ScriptStep::text("unreachable"),
        ]);
        let prompt = StreamChannel::new();
        prompt.enqueue(UserTurn::text("go"));
        prompt.done();

        let query = engine
            .query(request(
                &prompt,
                Arc::new(DenyWith { interrupt: true }),
                Hooks::new(),
            ))
            .await
            .expect("query starts");
        let events = collect(query).await;

        let results = tool_results(&events);
        assert_eq!(results, vec![ToolResultBlock::error("toolu_mock_1_0", "user said no")]);
        assert!(events.iter().any(|event| says(event, TOOL_INTERRUPT_MARKER)));
        assert!(!events.iter().any(|event| says(event, "unreachable")));
        assert!(events.last().is_some_and(EngineEvent::is_turn_end));
    }

    #[tokio::test]
    async fn pre_tool_use_block_skips_authorization() {
        let engine = ScriptedEngine::new(vec![ScriptStep::tool_call("Write", json!({}), "ok")]);
        let prompt = StreamChannel::new();
        prompt.enqueue(UserTurn::text("write"));
        prompt.done();
        let hooks = Hooks::new().with(HookPoint::PreToolUse, |context| {
            if context.tool_name == "Write" {
                HookDecision::block("writes are disabled")
            } else {
                HookDecision::Continue
            }
        });

        let query = engine
            .query(request(&prompt, Arc::new(DenyWith { interrupt: true }), hooks))
            .await
            .expect("query starts");
        let events = collect(query).await;

        assert_eq!(
            tool_results(&events),
            vec![ToolResultBlock::error("toolu_mock_1_0", "writes are disabled")]
        );
    }

    #[tokio::test]
    async fn interrupt_ends_the_current_turn_but_keeps_the_query() {
        let engine = ScriptedEngine::new(vec![
            ScriptStep::text("one"),
            ScriptStep::text("two"),
            ScriptStep::text("three"),
        ])
        .with_step_delay(Duration::from_millis(30));
        let prompt = StreamChannel::new();
        prompt.enqueue(UserTurn::text("first"));

        let mut query = engine
            .query(request(&prompt, Arc::new(AllowAll), Hooks::new()))
            .await
            .expect("query starts");

        // init, then the first text step
        query.events.next().await.expect("init");
        query.events.next().await.expect("first step");
        query.control.interrupt().await.expect("interrupt accepted");

        let mut tail = Vec::new();
        loop {
            let event = query.events.next().await.expect("event").expect("not done");
            let end = event.is_turn_end();
            tail.push(event);
            if end {
                break;
            }
        }
        assert!(tail.iter().any(|event| says(event, INTERRUPT_MARKER)));

        prompt.enqueue(UserTurn::text("second"));
        prompt.done();
        let rest = collect(query).await;
        assert!(rest.last().is_some_and(EngineEvent::is_turn_end));
        assert_eq!(
            rest.iter()
                .filter(|event| matches!(event, EngineEvent::Assistant(_)))
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn close_stops_the_query() {
        let engine = ScriptedEngine::default();
        let prompt = StreamChannel::new();

        let mut query = engine
            .query(request(&prompt, Arc::new(AllowAll), Hooks::new()))
            .await
            .expect("query starts");
        query.events.next().await.expect("init");
        query.control.close();

        assert_eq!(query.events.next().await, Ok(None));
        assert_eq!(query.control.interrupt().await, Err(EngineError::Closed));
    }
}
