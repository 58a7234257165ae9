use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use agent_engine::{PermissionDecision, ToolAuthorizer, ToolPermissionRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::protocol::ServerEvent;
use crate::transport::Transport;

pub const CHANNEL_CLOSED_REASON: &str = "channel closed";

/// One outstanding tool authorization round-trip, as pushed to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
}

struct Pending {
    session_id: String,
    resolver: oneshot::Sender<PermissionDecision>,
}

/// Single-fire resolvers keyed by permission request id.
#[derive(Default)]
pub struct PendingPermissions {
    pending: Mutex<HashMap<String, Pending>>,
}

impl fmt::Debug for PendingPermissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingPermissions")
            .field("pending", &self.len())
            .finish()
    }
}

impl PendingPermissions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resolver for a fresh request id.
    pub fn register(&self, session_id: &str) -> (String, oneshot::Receiver<PermissionDecision>) {
        let id = Uuid::new_v4().to_string();
        let (resolver, receiver) = oneshot::channel();
        self.lock_pending().insert(
            id.clone(),
            Pending {
                session_id: session_id.to_string(),
                resolver,
            },
        );
        (id, receiver)
    }

    /// Fires the resolver for `id` once and returns its session id.
    pub fn resolve(
        &self,
        id: &str,
        decision: PermissionDecision,
    ) -> Result<String, OrchestratorError> {
        let pending = self
            .lock_pending()
            .remove(id)
            .ok_or_else(|| OrchestratorError::UnknownPermissionRequest(id.to_string()))?;
        if pending.resolver.send(decision).is_err() {
            // The execution step went away; the resolution still counts.
            debug!(permission_id = id, "permission waiter dropped before resolution");
        }
        Ok(pending.session_id)
    }

    /// Denies every request owned by `session_id` with an interrupting
    /// "channel closed" decision and returns their ids.
    pub fn reject_all_for(&self, session_id: &str) -> Vec<String> {
        let rejected: Vec<(String, Pending)> = {
            let mut pending = self.lock_pending();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, entry)| entry.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        rejected
            .into_iter()
            .map(|(id, entry)| {
                let _ = entry
                    .resolver
                    .send(PermissionDecision::deny(CHANNEL_CLOSED_REASON, true));
                id
            })
            .collect()
    }

    /// Drops a request whose waiter gave up without a resolution.
    pub fn forget(&self, id: &str) {
        self.lock_pending().remove(id);
    }

    /// Removes `id` if still pending; returns whether it was.
    fn take(&self, id: &str) -> bool {
        self.lock_pending().remove(id).is_some()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.lock_pending().contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_pending().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Authorization callback handed to the engine for one channel: pushes a
/// `permission_request` to the UI and suspends until it is resolved.
pub struct ChannelAuthorizer {
    session_id: String,
    pending: Arc<PendingPermissions>,
    transport: Arc<dyn Transport>,
}

impl ChannelAuthorizer {
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        pending: Arc<PendingPermissions>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            pending,
            transport,
        }
    }
}

#[async_trait]
impl ToolAuthorizer for ChannelAuthorizer {
    async fn authorize(&self, request: ToolPermissionRequest) -> PermissionDecision {
        let (id, receiver) = self.pending.register(&self.session_id);
        let event = ServerEvent::PermissionRequest(PermissionRequest {
            id: id.clone(),
            session_id: self.session_id.clone(),
            tool_name: request.tool_name,
            input: request.input,
            suggestions: request.suggestions,
            tool_use_id: request.tool_use_id,
        });

        let sent = event
            .to_envelope()
            .map_err(|error| error.to_string())
            .and_then(|envelope| {
                self.transport
                    .send(envelope)
                    .map_err(|error| error.to_string())
            });
        if let Err(error) = sent {
            warn!(session_id = %self.session_id, permission_id = %id, %error, "could not push permission request");
            self.pending.forget(&id);
            return PermissionDecision::deny(
                format!("permission request undeliverable: {error}"),
                true,
            );
        }
        debug!(session_id = %self.session_id, permission_id = %id, "awaiting permission");

        let mut abandon = AbandonGuard {
            armed: true,
            id: &id,
            session_id: &self.session_id,
            pending: &self.pending,
            transport: self.transport.as_ref(),
        };
        let decision = match receiver.await {
            Ok(decision) => decision,
            Err(_) => PermissionDecision::deny(CHANNEL_CLOSED_REASON, true),
        };
        abandon.armed = false;
        decision
    }
}

/// Withdraws a request whose waiter was dropped before any resolution,
/// e.g. when the engine abandons the tool call on interrupt.
struct AbandonGuard<'a> {
    armed: bool,
    id: &'a str,
    session_id: &'a str,
    pending: &'a PendingPermissions,
    transport: &'a dyn Transport,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if !self.armed || !self.pending.take(self.id) {
            return;
        }
        debug!(session_id = self.session_id, permission_id = self.id, "permission request withdrawn");
        let withdrawn = ServerEvent::PermissionResolved {
            session_id: self.session_id.to_string(),
            id: self.id.to_string(),
            allowed: false,
        };
        if let Ok(envelope) = withdrawn.to_envelope() {
            let _ = self.transport.send(envelope);
        }
    }
}
