use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use agent_engine::{
    ChannelError, ChannelReader, ContentBlock, EngineError, EngineEvent, EngineProfile,
    ExecutionEngine, HookContext, HookDecision, HookPoint, Hooks, PermissionDecision,
    PermissionMode, Query, QueryControl, QueryRequest, StreamChannel, ToolAuthorizer, UserTurn,
};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::{CliEngineConfig, CLI_ENGINE_ID};
use crate::error::CliEngineError;
use crate::ndjson::{InboundFrame, NdjsonParser};
use crate::protocol::{self, ControlRequest};

type ControlOutcome = Result<Value, String>;

const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Engine that runs each query in its own agent child process.
#[derive(Debug, Clone, Default)]
pub struct CliEngine {
    config: CliEngineConfig,
}

impl CliEngine {
    #[must_use]
    pub fn new(config: CliEngineConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &CliEngineConfig {
        &self.config
    }
}

#[async_trait]
impl ExecutionEngine for CliEngine {
    fn profile(&self) -> EngineProfile {
        EngineProfile {
            engine_id: CLI_ENGINE_ID.to_string(),
            default_model: None,
        }
    }

    async fn query(&self, request: QueryRequest) -> Result<Query, EngineError> {
        let executable = self.config.resolve_executable()?;
        let mut command = Command::new(&executable);
        command
            .args(self.config.command_args(&request.options))
            .current_dir(&request.options.cwd)
            .envs(&self.config.env)
            .envs(&request.options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(CliEngineError::Spawn)?;
        let stdin = child
            .stdin
            .take()
            .ok_or(CliEngineError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(CliEngineError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(CliEngineError::MissingPipe("stderr"))?;

        let session_id = request.session_id.clone();
        info!(
            session_id = %session_id,
            pid = child.id(),
            executable = %executable.display(),
            "agent process spawned"
        );

        let events = StreamChannel::new();
        let reader = events.reader()?;
        let link = Arc::new(ProcessLink::new(stdin, self.config.control_timeout));
        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));

        let input_task = tokio::spawn(pump_prompt(
            request.prompt,
            Arc::clone(&link),
            session_id.clone(),
        ));
        let stderr_task = tokio::spawn(collect_stderr(
            stderr,
            Arc::clone(&stderr_tail),
            self.config.stderr_tail_lines,
            session_id.clone(),
        ));
        let output = OutputPump {
            session_id,
            events: events.clone(),
            link: Arc::clone(&link),
            authorizer: request.authorizer,
            hooks: Arc::new(request.hooks),
            stderr_tail,
            tool_uses: HashMap::new(),
            permissions: Arc::new(Mutex::new(HashMap::new())),
        };
        let stderr_abort = stderr_task.abort_handle();
        let output_task = tokio::spawn(output.run(child, stdout, stderr_task));

        // Aborting the output task drops the child, which kills it.
        let aborts = [
            input_task.abort_handle(),
            stderr_abort,
            output_task.abort_handle(),
        ];
        events.set_cleanup(move || {
            for abort in aborts {
                abort.abort();
            }
        });

        Ok(Query {
            events: reader,
            control: Arc::new(CliControl { link, events }),
        })
    }
}

/// Shared write side of one agent process.
struct ProcessLink {
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pending: Mutex<HashMap<String, oneshot::Sender<ControlOutcome>>>,
    next_request: AtomicU64,
    control_timeout: Duration,
    engine_session_id: Mutex<Option<String>>,
    turns_in_flight: AtomicUsize,
    idle: Notify,
}

impl ProcessLink {
    fn new(stdin: ChildStdin, control_timeout: Duration) -> Self {
        Self {
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            control_timeout,
            engine_session_id: Mutex::new(None),
            turns_in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    async fn write_line(&self, line: &str) -> Result<(), CliEngineError> {
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin.as_mut().ok_or(CliEngineError::InputClosed)?;
        pipe.write_all(line.as_bytes())
            .await
            .map_err(CliEngineError::Write)?;
        pipe.flush().await.map_err(CliEngineError::Write)
    }

    async fn close_input(&self) {
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
    }

    async fn send_turn(&self, turn: &UserTurn) -> Result<(), CliEngineError> {
        let session_id = lock_unpoisoned(&self.engine_session_id).clone();
        let line = protocol::user_message_line(turn, session_id.as_deref())?;
        self.turns_in_flight.fetch_add(1, Ordering::SeqCst);
        if let Err(error) = self.write_line(&line).await {
            self.turn_finished();
            return Err(error);
        }
        Ok(())
    }

    fn turn_finished(&self) {
        let _ = self
            .turns_in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            });
        self.idle.notify_waiters();
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.turns_in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn control(&self, request: ControlRequest) -> Result<Value, CliEngineError> {
        let request_id = format!(
            "req_{}",
            self.next_request.fetch_add(1, Ordering::Relaxed)
        );
        let line = protocol::control_request_line(&request_id, &request)?;
        let (sender, receiver) = oneshot::channel();
        lock_unpoisoned(&self.pending).insert(request_id.clone(), sender);

        if let Err(error) = self.write_line(&line).await {
            lock_unpoisoned(&self.pending).remove(&request_id);
            return Err(error);
        }

        let subtype = request.subtype().to_string();
        match tokio::time::timeout(self.control_timeout, receiver).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(CliEngineError::ControlFailed { subtype, message }),
            Ok(Err(_)) => Err(CliEngineError::InputClosed),
            Err(_) => {
                lock_unpoisoned(&self.pending).remove(&request_id);
                Err(CliEngineError::ControlTimeout(subtype))
            }
        }
    }

    fn resolve_control(&self, request_id: &str, outcome: ControlOutcome) -> bool {
        match lock_unpoisoned(&self.pending).remove(request_id) {
            Some(sender) => sender.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Drops every pending control waiter; they observe a closed link.
    fn abandon_controls(&self) {
        lock_unpoisoned(&self.pending).clear();
    }
}

struct CliControl {
    link: Arc<ProcessLink>,
    events: StreamChannel<EngineEvent>,
}

impl CliControl {
    async fn send(&self, request: ControlRequest) -> Result<(), EngineError> {
        if self.events.is_done() {
            return Err(EngineError::Closed);
        }
        self.link.control(request).await?;
        Ok(())
    }
}

#[async_trait]
impl QueryControl for CliControl {
    async fn interrupt(&self) -> Result<(), EngineError> {
        self.send(ControlRequest::Interrupt).await
    }

    async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), EngineError> {
        self.send(ControlRequest::SetPermissionMode { mode }).await
    }

    async fn set_model(&self, model: Option<String>) -> Result<(), EngineError> {
        self.send(ControlRequest::SetModel { model }).await
    }

    fn close(&self) {
        self.events.close();
    }
}

async fn pump_prompt(
    mut prompt: ChannelReader<UserTurn>,
    link: Arc<ProcessLink>,
    session_id: String,
) {
    loop {
        match prompt.next().await {
            Ok(Some(turn)) => {
                if let Err(error) = link.send_turn(&turn).await {
                    warn!(session_id = %session_id, error = %error, "failed to deliver user turn");
                    break;
                }
            }
            Ok(None) => break,
            Err(error) => {
                warn!(session_id = %session_id, error = %error, "prompt source failed");
                break;
            }
        }
    }

    // Let the agent finish the turn it is working on before signalling EOF.
    link.wait_idle().await;
    link.close_input().await;
    debug!(session_id = %session_id, "agent input closed");
}

async fn collect_stderr(
    stderr: ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
    limit: usize,
    session_id: String,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(session_id = %session_id, "agent stderr: {line}");
        let mut kept = lock_unpoisoned(&tail);
        kept.push_back(line);
        while kept.len() > limit {
            kept.pop_front();
        }
    }
}

struct OutputPump {
    session_id: String,
    events: StreamChannel<EngineEvent>,
    link: Arc<ProcessLink>,
    authorizer: Arc<dyn ToolAuthorizer>,
    hooks: Arc<Hooks>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    /// Tool name and input per tool_use id, for post-tool-use hooks.
    tool_uses: HashMap<String, (String, Value)>,
    /// Permission prompts still waiting on the authorizer, by control request id.
    permissions: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl OutputPump {
    async fn run(
        mut self,
        mut child: Child,
        mut stdout: ChildStdout,
        stderr_task: JoinHandle<()>,
    ) {
        let mut parser = NdjsonParser::default();
        let mut chunk = vec![0u8; 8 * 1024];

        loop {
            match stdout.read(&mut chunk).await {
                Ok(0) => break,
                Ok(read) => {
                    for frame in parser.feed(&chunk[..read]) {
                        self.handle_frame(frame);
                    }
                }
                Err(error) => {
                    warn!(session_id = %self.session_id, error = %error, "agent stdout read failed");
                    break;
                }
            }
        }
        for frame in parser.finish() {
            self.handle_frame(frame);
        }

        self.link.abandon_controls();
        self.abandon_permissions();
        self.link.close_input().await;

        let exit = child.wait().await;
        // stderr reaches EOF with the process unless a descendant keeps it open.
        let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, stderr_task).await;

        match exit {
            Ok(status) if status.success() => {
                info!(session_id = %self.session_id, "agent process exited");
                self.events.done();
            }
            Ok(status) => {
                let tail = lock_unpoisoned(&self.stderr_tail)
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("\n");
                error!(session_id = %self.session_id, %status, "agent process failed");
                let message = if tail.is_empty() {
                    format!("agent process exited with {status}")
                } else {
                    format!("agent process exited with {status}: {tail}")
                };
                self.events.error(ChannelError::failed(message));
            }
            Err(wait_error) => {
                error!(session_id = %self.session_id, error = %wait_error, "failed to reap agent process");
                self.events
                    .error(ChannelError::failed(format!("agent process lost: {wait_error}")));
            }
        }
    }

    fn handle_frame(&mut self, frame: InboundFrame) {
        match frame {
            InboundFrame::Event(event) => self.forward_event(event),
            InboundFrame::ControlRequest {
                request_id,
                request,
            } => self.answer_control(request_id, request),
            InboundFrame::ControlResponse {
                request_id,
                outcome,
            } => {
                if !self.link.resolve_control(&request_id, outcome) {
                    debug!(session_id = %self.session_id, request_id = %request_id, "control response without waiter");
                }
            }
            InboundFrame::ControlCancel { request_id } => self.cancel_permission(&request_id),
            InboundFrame::Ignored { kind } => {
                debug!(session_id = %self.session_id, kind = %kind, "ignoring agent output");
            }
            InboundFrame::Malformed { line, reason } => {
                warn!(session_id = %self.session_id, reason = %reason, "malformed agent output: {line}");
            }
        }
    }

    fn forward_event(&mut self, event: EngineEvent) {
        match &event {
            EngineEvent::System(system) if system.is_init() => {
                *lock_unpoisoned(&self.link.engine_session_id) = system.session_id.clone();
            }
            EngineEvent::Assistant(assistant) => {
                for tool_use in assistant
                    .message
                    .content
                    .iter_blocks()
                    .filter_map(ContentBlock::as_tool_use)
                {
                    self.tool_uses.insert(
                        tool_use.id.clone(),
                        (tool_use.name.clone(), tool_use.input.clone()),
                    );
                }
            }
            EngineEvent::User(user) => {
                for result in user
                    .message
                    .content
                    .iter_blocks()
                    .filter_map(ContentBlock::as_tool_result)
                {
                    let Some((name, input)) = self.tool_uses.remove(&result.tool_use_id) else {
                        continue;
                    };
                    let decision = self.hooks.run(&HookContext {
                        point: HookPoint::PostToolUse,
                        tool_name: &name,
                        input: &input,
                        tool_use_id: Some(&result.tool_use_id),
                        result: Some(result),
                    });
                    if let HookDecision::Block { reason } = decision {
                        info!(session_id = %self.session_id, tool = %name, reason = %reason, "post-tool-use hook stopped the turn");
                        let link = Arc::clone(&self.link);
                        tokio::spawn(async move {
                            let _ = link.control(ControlRequest::Interrupt).await;
                        });
                    }
                }
            }
            EngineEvent::Result(_) => self.link.turn_finished(),
            EngineEvent::System(_) => {}
        }

        self.events.enqueue(event);
    }

    fn answer_control(&self, request_id: String, request: Value) {
        let link = Arc::clone(&self.link);
        let session_id = self.session_id.clone();

        let Some(permission) = protocol::parse_can_use_tool(&request) else {
            let subtype = request
                .get("subtype")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            warn!(session_id = %session_id, subtype = %subtype, "unsupported control request from agent");
            tokio::spawn(async move {
                let message = format!("unsupported control request: {subtype}");
                if let Ok(line) = protocol::control_error_line(&request_id, &message) {
                    let _ = link.write_line(&line).await;
                }
            });
            return;
        };

        let authorizer = Arc::clone(&self.authorizer);
        let hooks = Arc::clone(&self.hooks);
        let permissions = Arc::clone(&self.permissions);
        // Held across the spawn so the task cannot deregister before it is registered.
        let mut in_flight = lock_unpoisoned(&self.permissions);
        let key = request_id.clone();
        let task = tokio::spawn(async move {
            let pre = hooks.run(&HookContext {
                point: HookPoint::PreToolUse,
                tool_name: &permission.tool_name,
                input: &permission.input,
                tool_use_id: permission.tool_use_id.as_deref(),
                result: None,
            });
            let decision = match pre {
                HookDecision::Block { reason } => PermissionDecision::deny(reason, false),
                HookDecision::Continue => authorizer.authorize(permission).await,
            };

            let written = match protocol::permission_response_line(&request_id, &decision) {
                Ok(line) => link.write_line(&line).await,
                Err(error) => Err(error.into()),
            };
            if let Err(error) = written {
                warn!(session_id = %session_id, request_id = %request_id, error = %error, "failed to answer permission request");
            }
            lock_unpoisoned(&permissions).remove(&request_id);
        });
        in_flight.insert(key, task.abort_handle());
    }

    /// Drops the authorizer future of a prompt the agent no longer needs.
    fn cancel_permission(&self, request_id: &str) {
        match lock_unpoisoned(&self.permissions).remove(request_id) {
            Some(task) => {
                debug!(session_id = %self.session_id, request_id = %request_id, "agent cancelled permission request");
                task.abort();
            }
            None => {
                debug!(session_id = %self.session_id, request_id = %request_id, "cancel for unknown control request");
            }
        }
    }

    fn abandon_permissions(&self) {
        for (_, task) in lock_unpoisoned(&self.permissions).drain() {
            task.abort();
        }
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
