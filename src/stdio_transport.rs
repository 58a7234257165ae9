//! Newline-delimited JSON envelopes over a byte stream pair.
//!
//! Every line on the reader is one [`Envelope`]; every outbound envelope is
//! written as one line and flushed. Malformed lines are logged and skipped.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use orchestrator::{Envelope, MessageHandler, OrchestratorError, Transport};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Default)]
struct Inbox {
    handler: Option<MessageHandler>,
    backlog: VecDeque<Envelope>,
}

/// Tasks pumping the two directions of a [`StdioTransport`].
#[derive(Debug)]
pub struct StdioTasks {
    /// Finishes at end of input.
    pub reader: JoinHandle<io::Result<()>>,
    /// Finishes once every transport handle is dropped or a write fails.
    pub writer: JoinHandle<io::Result<()>>,
}

pub struct StdioTransport {
    outgoing: mpsc::UnboundedSender<Envelope>,
    inbox: Arc<Mutex<Inbox>>,
}

impl fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inbox = lock_unpoisoned(&self.inbox);
        f.debug_struct("StdioTransport")
            .field("has_handler", &inbox.handler.is_some())
            .field("backlog", &inbox.backlog.len())
            .field("closed", &self.outgoing.is_closed())
            .finish()
    }
}

impl StdioTransport {
    /// Process stdin/stdout.
    pub fn stdio() -> (Self, StdioTasks) {
        Self::spawn(tokio::io::stdin(), tokio::io::stdout())
    }

    pub fn spawn<R, W>(reader: R, writer: W) -> (Self, StdioTasks)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing, queue) = mpsc::unbounded_channel();
        let inbox = Arc::new(Mutex::new(Inbox::default()));

        let tasks = StdioTasks {
            reader: tokio::spawn(read_envelopes(reader, Arc::clone(&inbox))),
            writer: tokio::spawn(write_envelopes(writer, queue)),
        };
        (Self { outgoing, inbox }, tasks)
    }
}

impl Transport for StdioTransport {
    fn send(&self, envelope: Envelope) -> Result<(), OrchestratorError> {
        self.outgoing
            .send(envelope)
            .map_err(|_| OrchestratorError::TransportClosed)
    }

    fn on_message(&self, handler: MessageHandler) {
        let backlog = {
            let mut inbox = lock_unpoisoned(&self.inbox);
            inbox.handler = Some(Arc::clone(&handler));
            std::mem::take(&mut inbox.backlog)
        };
        for envelope in backlog {
            handler(envelope);
        }
    }
}

async fn read_envelopes<R>(reader: R, inbox: Arc<Mutex<Inbox>>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut line_number = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let envelope = match serde_json::from_str::<Envelope>(&line) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(line = line_number, %error, "skipping malformed envelope");
                continue;
            }
        };

        let handler = {
            let mut state = lock_unpoisoned(&inbox);
            match state.handler.clone() {
                Some(handler) => handler,
                None => {
                    state.backlog.push_back(envelope);
                    continue;
                }
            }
        };
        handler(envelope);
    }
    debug!(lines = line_number, "input closed");
    Ok(())
}

async fn write_envelopes<W>(
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Envelope>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = queue.recv().await {
        let mut line = match serde_json::to_vec(&envelope) {
            Ok(line) => line,
            Err(error) => {
                warn!(kind = %envelope.kind, %error, "dropping unserializable envelope");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(error) = write_line(&mut writer, &line).await {
            warn!(%error, "output closed");
            queue.close();
            return Err(error);
        }
    }
    Ok(())
}

async fn write_line<W>(writer: &mut W, line: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line).await?;
    writer.flush().await
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
