use agent_engine::{
    EngineEvent, PermissionDecision, PermissionMode, ResultEvent, SystemEvent, Usage,
};
use orchestrator::{CloseReason, PermissionRequest, Request, ServerEvent};
use transcript::{Message, Role, Transcript};

use crate::error::ClientError;

/// Operations a projection may ask of the orchestrator. Every call is a
/// one-way request; effects come back as events.
pub trait SessionHost {
    fn send_message(&mut self, session_id: &str, text: &str);
    fn interrupt(&mut self, session_id: &str);
    fn set_permission_mode(&mut self, session_id: &str, mode: PermissionMode);
    fn set_model(&mut self, session_id: &str, model: Option<String>);
    fn resolve_permission(
        &mut self,
        session_id: &str,
        request_id: &str,
        decision: PermissionDecision,
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Idle,
    Busy,
    /// Interrupt requested; the engine has not finished the turn yet.
    Interrupting,
}

/// Client-side mirror of one session's channel.
#[derive(Debug)]
pub struct Session {
    session_id: String,
    activity: Activity,
    transcript: Transcript,
    permission_queue: Vec<PermissionRequest>,
    usage: Usage,
    total_cost_usd: f64,
    turns: u32,
    cwd: Option<String>,
    model: Option<String>,
    permission_mode: PermissionMode,
    engine_session_id: Option<String>,
    last_error: Option<String>,
    close_reason: Option<CloseReason>,
}

impl Session {
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            activity: Activity::Idle,
            transcript: Transcript::new(),
            permission_queue: Vec::new(),
            usage: Usage::default(),
            total_cost_usd: 0.0,
            turns: 0,
            cwd: None,
            model: None,
            permission_mode: PermissionMode::Default,
            engine_session_id: None,
            last_error: None,
            close_reason: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn activity(&self) -> Activity {
        self.activity
    }

    pub fn is_busy(&self) -> bool {
        self.activity != Activity::Idle
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Outstanding permission prompts, oldest first.
    pub fn permission_queue(&self) -> &[PermissionRequest] {
        &self.permission_queue
    }

    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.total_cost_usd
    }

    /// Completed turns observed on this projection.
    pub fn turns(&self) -> u32 {
        self.turns
    }

    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn permission_mode(&self) -> PermissionMode {
        self.permission_mode
    }

    pub fn engine_session_id(&self) -> Option<&str> {
        self.engine_session_id.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// Echoes the prompt into the transcript, goes busy and forwards it.
    /// Blank prompts are ignored.
    pub fn send(&mut self, host: &mut dyn SessionHost, text: &str) -> bool {
        let prompt = text.trim();
        if prompt.is_empty() {
            return false;
        }

        self.transcript.push(Message::text(Role::User, prompt));
        self.activity = Activity::Busy;
        self.last_error = None;
        self.close_reason = None;
        host.send_message(&self.session_id, prompt);
        true
    }

    /// Requests a cooperative interrupt. The projection stays busy until the
    /// engine ends the turn.
    pub fn interrupt(&mut self, host: &mut dyn SessionHost) -> bool {
        if self.activity == Activity::Idle {
            return false;
        }
        self.activity = Activity::Interrupting;
        host.interrupt(&self.session_id);
        true
    }

    pub fn set_permission_mode(&mut self, host: &mut dyn SessionHost, mode: PermissionMode) {
        self.permission_mode = mode;
        host.set_permission_mode(&self.session_id, mode);
    }

    pub fn set_model(&mut self, host: &mut dyn SessionHost, model: Option<String>) {
        self.model.clone_from(&model);
        host.set_model(&self.session_id, model);
    }

    /// Answers a queued permission prompt. The entry leaves the queue when
    /// the orchestrator confirms with `permission_resolved`.
    pub fn resolve_permission(
        &mut self,
        host: &mut dyn SessionHost,
        request_id: &str,
        decision: PermissionDecision,
    ) -> Result<(), ClientError> {
        if !self
            .permission_queue
            .iter()
            .any(|request| request.id == request_id)
        {
            return Err(ClientError::UnknownPermissionRequest(request_id.to_string()));
        }
        host.resolve_permission(&self.session_id, request_id, decision);
        Ok(())
    }

    /// Mirrors one server event addressed to this session.
    pub fn apply(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::SessionEvent { event, .. } => self.apply_engine_event(event),
            ServerEvent::PermissionRequest(request) => {
                if !self
                    .permission_queue
                    .iter()
                    .any(|queued| queued.id == request.id)
                {
                    self.permission_queue.push(request.clone());
                }
            }
            ServerEvent::PermissionResolved { id, .. } => {
                self.permission_queue.retain(|request| &request.id != id);
            }
            ServerEvent::SessionError { error, .. } => {
                self.last_error = Some(error.clone());
                self.activity = Activity::Idle;
            }
            ServerEvent::SessionClosed { reason, .. } => {
                self.close_reason = Some(*reason);
                self.permission_queue.clear();
                self.activity = Activity::Idle;
            }
        }
    }

    fn apply_engine_event(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::System(system) => self.apply_system(system),
            EngineEvent::Result(result) => self.apply_result(result),
            EngineEvent::Assistant(_) | EngineEvent::User(_) => {}
        }
        self.transcript.apply_event(event);
    }

    fn apply_system(&mut self, system: &SystemEvent) {
        if !system.is_init() {
            return;
        }
        if let Some(session_id) = &system.session_id {
            self.engine_session_id = Some(session_id.clone());
        }
        if let Some(cwd) = &system.cwd {
            self.cwd = Some(cwd.clone());
        }
        if let Some(model) = &system.model {
            self.model = Some(model.clone());
        }
        if let Some(mode) = system.permission_mode {
            self.permission_mode = mode;
        }
    }

    fn apply_result(&mut self, result: &ResultEvent) {
        if let Some(usage) = &result.usage {
            self.usage.accumulate(usage);
        }
        self.total_cost_usd += result.total_cost_usd.unwrap_or(0.0);
        self.turns += 1;
        if result.is_error {
            self.last_error = Some(
                result
                    .result
                    .clone()
                    .unwrap_or_else(|| result.subtype.clone()),
            );
        }
        self.activity = Activity::Idle;
    }

    /// Records a rejected one-way request. A failed send or start leaves
    /// nothing running, so the projection goes idle.
    pub fn request_failed(&mut self, kind: &str, message: &str) {
        self.last_error = Some(message.to_string());
        if kind == Request::SEND_MESSAGE || kind == Request::START_SESSION {
            self.activity = Activity::Idle;
        }
    }
}
