use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use agent_engine::{PermissionDecision, PermissionMode};
use orchestrator::{
    Envelope, PermissionResponseParams, Request, SendMessageParams, ServerEvent, SessionParams,
    SetModelParams, SetPermissionModeParams, StartSessionParams, Transport, RESPONSE_SUFFIX,
};
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ClientError;
use crate::session::{Session, SessionHost};

enum Pending {
    /// Someone awaits the response.
    Waiter(oneshot::Sender<Envelope>),
    /// Fire-and-forget request issued by a projection; a failure is reported
    /// to that session.
    Posted { session_id: String },
}

#[derive(Default)]
struct ClientState {
    pending: HashMap<String, Pending>,
    sessions: HashMap<String, Session>,
}

/// Client end of the transport: correlates responses with requests and
/// routes server events to session projections.
pub struct OrchestratorClient {
    transport: Arc<dyn Transport>,
    state: Mutex<ClientState>,
    changes: watch::Sender<u64>,
}

impl fmt::Debug for OrchestratorClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("OrchestratorClient")
            .field("pending", &state.pending.len())
            .field("sessions", &state.sessions.len())
            .finish_non_exhaustive()
    }
}

impl OrchestratorClient {
    /// Wraps `transport` and installs the inbound handler.
    pub fn connect(transport: Arc<dyn Transport>) -> Arc<Self> {
        let (changes, _) = watch::channel(0);
        let client = Arc::new(Self {
            transport,
            state: Mutex::new(ClientState::default()),
            changes,
        });

        let weak = Arc::downgrade(&client);
        client.transport.on_message(Arc::new(move |envelope: Envelope| {
            if let Some(client) = weak.upgrade() {
                client.receive(envelope);
            }
        }));
        client
    }

    /// Ticks after every routed event or response.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Sends `request` and waits for its response payload.
    pub async fn request(&self, request: Request) -> Result<Value, ClientError> {
        let kind = request.kind();
        let request_id = Uuid::new_v4().to_string();
        let envelope = request
            .to_envelope(request_id.clone())
            .map_err(|source| ClientError::Encode { kind, source })?;

        let (waiter, response) = oneshot::channel();
        self.lock_state()
            .pending
            .insert(request_id.clone(), Pending::Waiter(waiter));
        if let Err(error) = self.transport.send(envelope) {
            self.lock_state().pending.remove(&request_id);
            return Err(error.into());
        }

        let response = response
            .await
            .map_err(|_| ClientError::Disconnected(kind))?;
        if response.succeeded() {
            Ok(response.payload)
        } else {
            Err(ClientError::rejected(
                kind,
                response.error_message().unwrap_or("request failed"),
            ))
        }
    }

    /// Registers a projection for `session_id` if none exists.
    pub fn open_session(&self, session_id: &str) {
        self.lock_state()
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id));
    }

    pub async fn start_session(&self, params: StartSessionParams) -> Result<(), ClientError> {
        self.open_session(&params.session_id);
        self.request(Request::StartSession(params)).await?;
        Ok(())
    }

    pub async fn close_session(&self, session_id: &str) -> Result<bool, ClientError> {
        let payload = self
            .request(Request::CloseSession(SessionParams {
                session_id: session_id.to_string(),
            }))
            .await?;
        Ok(payload
            .get("closed")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    /// Runs `action` against a projection with a host that forwards its
    /// requests once the projection is released.
    pub fn with_session<R>(
        &self,
        session_id: &str,
        action: impl FnOnce(&mut Session, &mut dyn SessionHost) -> R,
    ) -> Result<R, ClientError> {
        let mut outbox = Outbox::default();
        let result = {
            let mut state = self.lock_state();
            let session = state
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| ClientError::UnknownSession(session_id.to_string()))?;
            action(session, &mut outbox)
        };

        for request in outbox.requests {
            self.post(session_id, request);
        }
        self.notify();
        Ok(result)
    }

    /// Read-only view of a projection.
    pub fn inspect<R>(&self, session_id: &str, view: impl FnOnce(&Session) -> R) -> Option<R> {
        self.lock_state().sessions.get(session_id).map(view)
    }

    #[must_use]
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_state().sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolves once `condition` holds for the projection.
    pub async fn wait_until(
        &self,
        session_id: &str,
        condition: impl Fn(&Session) -> bool,
    ) -> Result<(), ClientError> {
        let mut changes = self.subscribe();
        loop {
            let holds = self
                .inspect(session_id, &condition)
                .ok_or_else(|| ClientError::UnknownSession(session_id.to_string()))?;
            if holds {
                return Ok(());
            }
            if changes.changed().await.is_err() {
                return Err(ClientError::Disconnected("session update"));
            }
        }
    }

    fn post(&self, session_id: &str, request: Request) {
        let kind = request.kind();
        let request_id = Uuid::new_v4().to_string();
        let envelope = match request.to_envelope(request_id.clone()) {
            Ok(envelope) => envelope,
            Err(error) => {
                self.fail_posted(session_id, kind, &error.to_string());
                return;
            }
        };

        self.lock_state().pending.insert(
            request_id.clone(),
            Pending::Posted {
                session_id: session_id.to_string(),
            },
        );
        if let Err(error) = self.transport.send(envelope) {
            self.lock_state().pending.remove(&request_id);
            self.fail_posted(session_id, kind, &error.to_string());
        }
    }

    fn fail_posted(&self, session_id: &str, kind: &str, message: &str) {
        warn!(session_id, kind, error = message, "request failed");
        if let Some(session) = self.lock_state().sessions.get_mut(session_id) {
            session.request_failed(kind, message);
        }
    }

    fn receive(&self, envelope: Envelope) {
        if envelope.is_response() {
            self.on_response(envelope);
        } else {
            match ServerEvent::from_envelope(&envelope) {
                Ok(Some(event)) => self.route(&event),
                Ok(None) => debug!(kind = %envelope.kind, "ignoring unknown envelope"),
                Err(error) => warn!(kind = %envelope.kind, %error, "malformed server event"),
            }
        }
        self.notify();
    }

    fn on_response(&self, envelope: Envelope) {
        let Some(request_id) = envelope.request_id.clone() else {
            warn!(kind = %envelope.kind, "response without request id");
            return;
        };
        let pending = self.lock_state().pending.remove(&request_id);
        match pending {
            Some(Pending::Waiter(waiter)) => {
                if waiter.send(envelope).is_err() {
                    debug!(request_id = %request_id, "requester went away");
                }
            }
            Some(Pending::Posted { session_id }) => {
                if !envelope.succeeded() {
                    let kind = envelope
                        .kind
                        .strip_suffix(RESPONSE_SUFFIX)
                        .unwrap_or(&envelope.kind);
                    self.fail_posted(
                        &session_id,
                        kind,
                        envelope.error_message().unwrap_or("request failed"),
                    );
                }
            }
            None => debug!(request_id = %request_id, "response for unknown request"),
        }
    }

    fn route(&self, event: &ServerEvent) {
        let mut state = self.lock_state();
        match state.sessions.get_mut(event.session_id()) {
            Some(session) => session.apply(event),
            None => debug!(session_id = event.session_id(), "event for unopened session"),
        }
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Collects projection requests while the client state is locked.
#[derive(Default)]
struct Outbox {
    requests: Vec<Request>,
}

impl SessionHost for Outbox {
    fn send_message(&mut self, session_id: &str, text: &str) {
        self.requests.push(Request::SendMessage(SendMessageParams {
            session_id: session_id.to_string(),
            text: text.to_string(),
        }));
    }

    fn interrupt(&mut self, session_id: &str) {
        self.requests.push(Request::Interrupt(SessionParams {
            session_id: session_id.to_string(),
        }));
    }

    fn set_permission_mode(&mut self, session_id: &str, mode: PermissionMode) {
        self.requests
            .push(Request::SetPermissionMode(SetPermissionModeParams {
                session_id: session_id.to_string(),
                mode,
            }));
    }

    fn set_model(&mut self, session_id: &str, model: Option<String>) {
        self.requests.push(Request::SetModel(SetModelParams {
            session_id: session_id.to_string(),
            model,
        }));
    }

    fn resolve_permission(
        &mut self,
        _session_id: &str,
        request_id: &str,
        decision: PermissionDecision,
    ) {
        self.requests
            .push(Request::PermissionResponse(PermissionResponseParams {
                id: request_id.to_string(),
                decision,
            }));
    }
}
