use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};

use agent_engine::{
    ChannelReader, EngineEvent, ExecutionEngine, HookDecision, HookPoint, Hooks,
    PermissionDecision, PermissionMode, QueryOptions, QueryRequest, StreamChannel, UserTurn,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::collaborators::{AssetCatalog, CredentialStore, FileSearch, SessionHistory};
use crate::error::OrchestratorError;
use crate::permissions::{ChannelAuthorizer, PendingPermissions};
use crate::protocol::{CloseReason, Envelope, Request, ServerEvent, StartSessionParams};
use crate::registry::{ChannelEntry, ChannelRegistry};
use crate::transport::Transport;

pub const INTERRUPTED_HOOK_REASON: &str = "interrupted by user";

/// Defaults applied to sessions started without explicit options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDefaults {
    pub cwd: PathBuf,
    pub permission_mode: PermissionMode,
    pub model: Option<String>,
}

impl SessionDefaults {
    #[must_use]
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            permission_mode: PermissionMode::Default,
            model: None,
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
}

/// Per-session settings remembered across channel restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Remembered {
    cwd: Option<PathBuf>,
    permission_mode: Option<PermissionMode>,
    model: Option<Option<String>>,
}

/// Owns one channel per live session and routes UI requests to them.
pub struct SessionOrchestrator {
    engine: Arc<dyn ExecutionEngine>,
    transport: Arc<dyn Transport>,
    registry: ChannelRegistry,
    permissions: Arc<PendingPermissions>,
    defaults: SessionDefaults,
    remembered: Mutex<HashMap<String, Remembered>>,
    hooks: Hooks,
    credentials: Option<Arc<dyn CredentialStore>>,
    assets: Option<Arc<dyn AssetCatalog>>,
    files: Option<Arc<dyn FileSearch>>,
    history: Option<Arc<dyn SessionHistory>>,
}

impl fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("engine", &self.engine.profile())
            .field("registry", &self.registry)
            .field("permissions", &self.permissions)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl SessionOrchestrator {
    #[must_use]
    pub fn new(
        engine: Arc<dyn ExecutionEngine>,
        transport: Arc<dyn Transport>,
        defaults: SessionDefaults,
    ) -> Self {
        Self {
            engine,
            transport,
            registry: ChannelRegistry::new(),
            permissions: Arc::new(PendingPermissions::new()),
            defaults,
            remembered: Mutex::new(HashMap::new()),
            hooks: Hooks::new(),
            credentials: None,
            assets: None,
            files: None,
            history: None,
        }
    }

    /// Hooks run after the built-in interrupt guard for every channel.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    #[must_use]
    pub fn with_assets(mut self, assets: Arc<dyn AssetCatalog>) -> Self {
        self.assets = Some(assets);
        self
    }

    #[must_use]
    pub fn with_file_search(mut self, files: Arc<dyn FileSearch>) -> Self {
        self.files = Some(files);
        self
    }

    #[must_use]
    pub fn with_history(mut self, history: Arc<dyn SessionHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Starts a channel for `session_id`.
    ///
    /// Fails with `SessionAlreadyActive` while another channel (or start) for
    /// the id exists. Engine configuration errors are returned as-is and the
    /// slot is released.
    pub async fn start(
        self: &Arc<Self>,
        params: StartSessionParams,
    ) -> Result<Arc<ChannelEntry>, OrchestratorError> {
        let session_id = params.session_id.clone();
        let generation = self.registry.reserve(&session_id)?;

        match self.start_reserved(params, generation).await {
            Ok(entry) => Ok(entry),
            Err(error) => {
                self.registry.rollback(&session_id, generation);
                warn!(session_id = %session_id, generation, %error, "channel start failed");
                Err(error)
            }
        }
    }

    async fn start_reserved(
        self: &Arc<Self>,
        params: StartSessionParams,
        generation: u64,
    ) -> Result<Arc<ChannelEntry>, OrchestratorError> {
        let session_id = params.session_id.clone();
        let options = self.query_options(&params)?;
        let cwd = options.cwd.clone();

        let input = StreamChannel::<UserTurn>::new();
        let prompt = input.reader().map_err(agent_engine::EngineError::from)?;
        let interrupted = Arc::new(AtomicBool::new(false));
        let request = QueryRequest {
            session_id: session_id.clone(),
            prompt,
            options,
            authorizer: Arc::new(ChannelAuthorizer::new(
                session_id.clone(),
                Arc::clone(&self.permissions),
                Arc::clone(&self.transport),
            )),
            hooks: self.channel_hooks(Arc::clone(&interrupted)),
        };

        let query = self.engine.query(request).await?;
        let entry = Arc::new(ChannelEntry::new(
            session_id.clone(),
            generation,
            input,
            query.control,
            interrupted,
        ));

        if !self.registry.commit(Arc::clone(&entry)) {
            entry.shutdown();
            return Err(OrchestratorError::StartCancelled(session_id));
        }

        self.lock_remembered()
            .entry(session_id.clone())
            .or_default()
            .cwd = Some(cwd);
        info!(session_id = %session_id, generation, "channel started");
        let orchestrator = Arc::clone(self);
        let forwarded = Arc::clone(&entry);
        tokio::spawn(async move { orchestrator.forward(forwarded, query.events).await });
        Ok(entry)
    }

    fn query_options(
        &self,
        params: &StartSessionParams,
    ) -> Result<QueryOptions, OrchestratorError> {
        let remembered = self
            .lock_remembered()
            .get(&params.session_id)
            .cloned()
            .unwrap_or_default();

        let cwd = params
            .cwd
            .clone()
            .or(remembered.cwd)
            .unwrap_or_else(|| self.defaults.cwd.clone());
        let permission_mode = params
            .permission_mode
            .or(remembered.permission_mode)
            .unwrap_or(self.defaults.permission_mode);
        let model = params
            .model
            .clone()
            .or_else(|| remembered.model.clone().flatten())
            .or_else(|| self.defaults.model.clone());

        let env = match &self.credentials {
            Some(credentials) => credentials.active_provider()?.env,
            None => BTreeMap::new(),
        };

        Ok(QueryOptions::new(cwd)
            .with_permission_mode(permission_mode)
            .with_model(model)
            .with_resume(params.resume_token.clone())
            .with_env(env))
    }

    fn channel_hooks(&self, interrupted: Arc<AtomicBool>) -> Hooks {
        let mut hooks = Hooks::new().with(HookPoint::PreToolUse, move |_| {
            if interrupted.load(std::sync::atomic::Ordering::SeqCst) {
                HookDecision::block(INTERRUPTED_HOOK_REASON)
            } else {
                HookDecision::Continue
            }
        });
        hooks.extend(&self.hooks);
        hooks
    }

    async fn forward(
        self: Arc<Self>,
        entry: Arc<ChannelEntry>,
        mut events: ChannelReader<EngineEvent>,
    ) {
        let session_id = entry.session_id.clone();
        loop {
            match events.next().await {
                Ok(Some(event)) => self.emit(ServerEvent::SessionEvent {
                    session_id: session_id.clone(),
                    event,
                }),
                Ok(None) => {
                    if let Some(entry) = self
                        .registry
                        .remove_generation(&session_id, entry.generation)
                    {
                        debug!(session_id = %session_id, generation = entry.generation, "engine stream completed");
                        self.teardown(&entry, CloseReason::Completed);
                    }
                    return;
                }
                Err(error) => {
                    warn!(session_id = %session_id, generation = entry.generation, %error, "engine stream failed");
                    let removed = self
                        .registry
                        .remove_generation(&session_id, entry.generation);
                    self.emit(ServerEvent::SessionError {
                        session_id: session_id.clone(),
                        error: error.to_string(),
                    });
                    if let Some(entry) = removed {
                        self.teardown(&entry, CloseReason::Error);
                    }
                    return;
                }
            }
        }
    }

    /// Enqueues a user turn, starting the channel with remembered or default
    /// options when none is live.
    pub async fn send_message(
        self: &Arc<Self>,
        session_id: &str,
        text: impl Into<String>,
    ) -> Result<(), OrchestratorError> {
        let entry = match self.registry.get(session_id) {
            Some(entry) => entry,
            None => {
                self.start(StartSessionParams {
                    session_id: session_id.to_string(),
                    ..StartSessionParams::default()
                })
                .await?
            }
        };

        entry.clear_interrupted();
        if !entry.input.enqueue(UserTurn::text(text)) {
            return Err(OrchestratorError::InputClosed(session_id.to_string()));
        }
        debug!(session_id, "user turn enqueued");
        Ok(())
    }

    /// Cooperative interrupt: blocks further tool use in the current turn
    /// and asks the engine to stop. The channel stays open.
    pub async fn interrupt(&self, session_id: &str) -> Result<(), OrchestratorError> {
        let entry = self.live(session_id)?;
        entry.mark_interrupted();
        entry.control.interrupt().await?;
        info!(session_id, "interrupt requested");
        Ok(())
    }

    pub async fn set_permission_mode(
        &self,
        session_id: &str,
        mode: PermissionMode,
    ) -> Result<(), OrchestratorError> {
        if let Some(entry) = self.registry.get(session_id) {
            entry.control.set_permission_mode(mode).await?;
        }
        self.lock_remembered()
            .entry(session_id.to_string())
            .or_default()
            .permission_mode = Some(mode);
        Ok(())
    }

    pub async fn set_model(
        &self,
        session_id: &str,
        model: Option<String>,
    ) -> Result<(), OrchestratorError> {
        if let Some(entry) = self.registry.get(session_id) {
            entry.control.set_model(model.clone()).await?;
        }
        self.lock_remembered()
            .entry(session_id.to_string())
            .or_default()
            .model = Some(model);
        Ok(())
    }

    /// Forcefully closes one channel. Returns false if none was live.
    pub fn close_channel(&self, session_id: &str) -> bool {
        match self.registry.remove(session_id) {
            Some(entry) => {
                self.teardown(&entry, CloseReason::Closed);
                true
            }
            None => false,
        }
    }

    /// Closes every live channel so the next turn starts a fresh execution
    /// under the new credentials. Idempotent; returns how many were closed.
    pub fn close_all_channels_with_credential_change(&self) -> usize {
        let entries = self.registry.drain();
        for entry in &entries {
            self.teardown(entry, CloseReason::CredentialChange);
        }
        if !entries.is_empty() {
            info!(closed = entries.len(), "closed channels after credential change");
        }
        entries.len()
    }

    fn teardown(&self, entry: &ChannelEntry, reason: CloseReason) {
        entry.shutdown();
        for id in self.permissions.reject_all_for(&entry.session_id) {
            self.emit(ServerEvent::PermissionResolved {
                session_id: entry.session_id.clone(),
                id,
                allowed: false,
            });
        }
        info!(session_id = %entry.session_id, generation = entry.generation, ?reason, "channel closed");
        self.emit(ServerEvent::SessionClosed {
            session_id: entry.session_id.clone(),
            reason,
        });
    }

    pub fn resolve_permission(
        &self,
        id: &str,
        decision: PermissionDecision,
    ) -> Result<(), OrchestratorError> {
        let allowed = decision.is_allow();
        let session_id = self.permissions.resolve(id, decision)?;
        debug!(session_id = %session_id, permission_id = id, allowed, "permission resolved");
        self.emit(ServerEvent::PermissionResolved {
            session_id,
            id: id.to_string(),
            allowed,
        });
        Ok(())
    }

    /// Closes every channel whenever the credential store reports a change.
    pub fn watch_credentials(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut changes = self.credentials.as_ref()?.subscribe_changes();
        let orchestrator = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let Some(orchestrator) = orchestrator.upgrade() else {
                    return;
                };
                orchestrator.close_all_channels_with_credential_change();
            }
        }))
    }

    #[must_use]
    pub fn live_sessions(&self) -> Vec<String> {
        self.registry.live_session_ids()
    }

    #[must_use]
    pub fn pending_permissions(&self) -> usize {
        self.permissions.len()
    }

    /// Decodes and runs one request, producing exactly one response.
    pub async fn handle_envelope(self: &Arc<Self>, envelope: Envelope) -> Envelope {
        let request_id = envelope.request_id.clone();
        let request = match Request::from_envelope(&envelope) {
            Ok(request) => request,
            Err(error) => {
                warn!(kind = %envelope.kind, request_id = ?request_id, %error, "rejected request");
                return Envelope::failure(&envelope.kind, request_id, error);
            }
        };

        let kind = request.kind();
        match self.dispatch(request).await {
            Ok(fields) => Envelope::success(kind, request_id, fields),
            Err(error) => {
                debug!(kind, request_id = ?request_id, %error, "request failed");
                Envelope::failure(kind, request_id, error)
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, request: Request) -> Result<Value, OrchestratorError> {
        match request {
            Request::StartSession(params) => {
                let entry = self.start(params).await?;
                Ok(json!({ "sessionId": entry.session_id, "generation": entry.generation }))
            }
            Request::SendMessage(params) => {
                self.send_message(&params.session_id, params.text).await?;
                Ok(Value::Null)
            }
            Request::Interrupt(params) => {
                self.interrupt(&params.session_id).await?;
                Ok(Value::Null)
            }
            Request::CloseSession(params) => {
                let closed = self.close_channel(&params.session_id);
                Ok(json!({ "closed": closed }))
            }
            Request::SetPermissionMode(params) => {
                self.set_permission_mode(&params.session_id, params.mode)
                    .await?;
                Ok(Value::Null)
            }
            Request::SetModel(params) => {
                self.set_model(&params.session_id, params.model).await?;
                Ok(Value::Null)
            }
            Request::PermissionResponse(params) => {
                self.resolve_permission(&params.id, params.decision)?;
                Ok(Value::Null)
            }
            Request::ListSessions => {
                let history = match &self.history {
                    Some(history) => history.list()?,
                    None => Vec::new(),
                };
                Ok(json!({ "active": self.live_sessions(), "history": history }))
            }
            Request::LoadSession(params) => {
                let history = self
                    .history
                    .as_ref()
                    .ok_or(OrchestratorError::MissingCollaborator("session history"))?;
                let events = history.load(&params.session_id)?;
                Ok(json!({ "sessionId": params.session_id, "events": events }))
            }
            Request::ListAssets(params) => {
                let assets = self
                    .assets
                    .as_ref()
                    .ok_or(OrchestratorError::MissingCollaborator("asset catalog"))?;
                Ok(json!({ "assets": assets.list_assets(params.kind).await? }))
            }
            Request::SearchFiles(params) => {
                let files = self
                    .files
                    .as_ref()
                    .ok_or(OrchestratorError::MissingCollaborator("file search"))?;
                let root = params.cwd.unwrap_or_else(|| self.defaults.cwd.clone());
                Ok(json!({ "files": files.search(&root, &params.query, params.limit).await? }))
            }
            Request::GetActiveProvider => {
                let credentials = self
                    .credentials
                    .as_ref()
                    .ok_or(OrchestratorError::MissingCollaborator("credential store"))?;
                let provider = credentials.active_provider()?;
                Ok(json!({ "provider": provider.name, "envKeys": provider.env_keys() }))
            }
        }
    }

    /// Subscribes to the transport and serves requests until it drops the
    /// handler. Ordered requests run on the dispatch loop; the rest run on
    /// their own tasks so engine round-trips never hold up permission
    /// responses.
    pub fn serve(self: &Arc<Self>) -> JoinHandle<()> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Envelope>();
        self.transport.on_message(Arc::new(move |envelope: Envelope| {
            if sender.send(envelope).is_err() {
                debug!("dispatch loop gone; dropping envelope");
            }
        }));

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                if envelope.is_response() || ServerEvent::KINDS.contains(&envelope.kind.as_str()) {
                    warn!(kind = %envelope.kind, "ignoring non-request envelope");
                    continue;
                }
                let ordered = Request::from_envelope(&envelope)
                    .map(|request| request.is_ordered())
                    .unwrap_or(true);
                if ordered {
                    let response = orchestrator.handle_envelope(envelope).await;
                    orchestrator.send(response);
                } else {
                    let orchestrator = Arc::clone(&orchestrator);
                    tokio::spawn(async move {
                        let response = orchestrator.handle_envelope(envelope).await;
                        orchestrator.send(response);
                    });
                }
            }
        })
    }

    fn live(&self, session_id: &str) -> Result<Arc<ChannelEntry>, OrchestratorError> {
        self.registry
            .get(session_id)
            .ok_or_else(|| OrchestratorError::UnknownSession(session_id.to_string()))
    }

    fn emit(&self, event: ServerEvent) {
        match event.to_envelope() {
            Ok(envelope) => self.send(envelope),
            Err(error) => warn!(session_id = event.session_id(), %error, "could not encode event"),
        }
    }

    fn send(&self, envelope: Envelope) {
        if let Err(error) = self.transport.send(envelope) {
            warn!(%error, "transport send failed");
        }
    }

    fn lock_remembered(&self) -> MutexGuard<'_, HashMap<String, Remembered>> {
        match self.remembered.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
