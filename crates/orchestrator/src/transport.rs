use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::OrchestratorError;
use crate::protocol::Envelope;

pub type MessageHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Bidirectional envelope pipe between the UI surface and the orchestrator.
///
/// `send` never blocks. Handlers run on the delivering thread and must not
/// block; they typically hand the envelope to a task.
pub trait Transport: Send + Sync {
    fn send(&self, envelope: Envelope) -> Result<(), OrchestratorError>;

    /// Installs the inbound handler, replacing any previous one.
    fn on_message(&self, handler: MessageHandler);
}

#[derive(Default)]
struct Inbox {
    handler: Option<MessageHandler>,
    /// Envelopes delivered before a handler was installed.
    backlog: VecDeque<Envelope>,
    closed: bool,
}

impl Inbox {
    fn deliver(inbox: &Mutex<Inbox>, envelope: Envelope) -> Result<(), OrchestratorError> {
        let handler = {
            let mut state = lock_unpoisoned(inbox);
            if state.closed {
                return Err(OrchestratorError::TransportClosed);
            }
            match state.handler.clone() {
                Some(handler) => handler,
                None => {
                    state.backlog.push_back(envelope);
                    return Ok(());
                }
            }
        };
        handler(envelope);
        Ok(())
    }
}

/// One end of an in-process transport pair.
pub struct InMemoryTransport {
    inbox: Arc<Mutex<Inbox>>,
    peer: Arc<Mutex<Inbox>>,
}

impl fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock_unpoisoned(&self.inbox);
        f.debug_struct("InMemoryTransport")
            .field("has_handler", &state.handler.is_some())
            .field("backlog", &state.backlog.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl InMemoryTransport {
    /// Two connected endpoints: what one sends, the other receives.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let left = Arc::new(Mutex::new(Inbox::default()));
        let right = Arc::new(Mutex::new(Inbox::default()));
        (
            Self {
                inbox: Arc::clone(&left),
                peer: Arc::clone(&right),
            },
            Self {
                inbox: right,
                peer: left,
            },
        )
    }

    /// Disconnects both directions; later sends fail.
    pub fn close(&self) {
        for inbox in [&self.inbox, &self.peer] {
            let mut state = lock_unpoisoned(inbox);
            state.closed = true;
            state.handler = None;
            state.backlog.clear();
        }
    }
}

impl Transport for InMemoryTransport {
    fn send(&self, envelope: Envelope) -> Result<(), OrchestratorError> {
        Inbox::deliver(&self.peer, envelope)
    }

    fn on_message(&self, handler: MessageHandler) {
        let backlog = {
            let mut state = lock_unpoisoned(&self.inbox);
            state.handler = Some(Arc::clone(&handler));
            std::mem::take(&mut state.backlog)
        };
        for envelope in backlog {
            handler(envelope);
        }
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
    use serde_json::json;

    use super::*;

    fn recorder() -> (MessageHandler, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: MessageHandler = Arc::new(move |envelope: Envelope| {
            sink.lock().expect("lock").push(envelope.kind);
        });
        (handler, seen)
    }

    #[test]
    fn pair_delivers_in_both_directions() {
        let (ui, server) = InMemoryTransport::pair();
        let (server_handler, server_seen) = recorder();
        let (ui_handler, ui_seen) = recorder();
        server.on_message(server_handler);
        ui.on_message(ui_handler);

        ui.send(Envelope::new("list_sessions", Some("1".to_string()), json!({})))
            .expect("send");
        server
            .send(Envelope::new("list_sessions_response", Some("1".to_string()), json!({})))
            .expect("send");

        assert_eq!(*server_seen.lock().expect("lock"), vec!["list_sessions"]);
        assert_eq!(*ui_seen.lock().expect("lock"), vec!["list_sessions_response"]);
    }

    #[test]
    fn envelopes_sent_before_a_handler_are_replayed_in_order() {
        let (ui, server) = InMemoryTransport::pair();
        ui.send(Envelope::new("a", None, json!({}))).expect("send");
        ui.send(Envelope::new("b", None, json!({}))).expect("send");

        let (handler, seen) = recorder();
        server.on_message(handler);

        assert_eq!(*seen.lock().expect("lock"), vec!["a", "b"]);
    }

    #[test]
    fn closed_transport_rejects_sends() {
        let (ui, server) = InMemoryTransport::pair();
        server.close();

        assert!(matches!(
            ui.send(Envelope::new("a", None, json!({}))),
            Err(OrchestratorError::TransportClosed)
        ));
    }
}
