use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::stream::{self, Stream};
use tokio::sync::oneshot;

use crate::error::ChannelError;

type Delivery<T> = Result<Option<T>, ChannelError>;
type Cleanup = Box<dyn FnOnce() + Send>;

struct State<T> {
    buffer: VecDeque<T>,
    waiter: Option<oneshot::Sender<Delivery<T>>>,
    done: bool,
    error: Option<ChannelError>,
    reader_taken: bool,
    cleanup: Option<Cleanup>,
}

impl<T> State<T> {
    fn resolve_waiter(&mut self, delivery: Delivery<T>) {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(delivery);
        }
    }
}

/// Producer handle for a single-consumer channel.
///
/// Cloning the handle shares the same underlying queue, so any number of
/// producers may enqueue concurrently.
pub struct StreamChannel<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for StreamChannel<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Default for StreamChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for StreamChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock_unpoisoned(&self.state);
        f.debug_struct("StreamChannel")
            .field("buffered", &state.buffer.len())
            .field("done", &state.done)
            .field("error", &state.error)
            .field("reader_taken", &state.reader_taken)
            .finish()
    }
}

impl<T> StreamChannel<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                buffer: VecDeque::new(),
                waiter: None,
                done: false,
                error: None,
                reader_taken: false,
                cleanup: None,
            })),
        }
    }

    /// Creates a channel whose [`close`](Self::close) runs `cleanup` once.
    #[must_use]
    pub fn with_cleanup(cleanup: impl FnOnce() + Send + 'static) -> Self {
        let channel = Self::new();
        channel.set_cleanup(cleanup);
        channel
    }

    /// Replaces the cleanup callback run by [`close`](Self::close).
    pub fn set_cleanup(&self, cleanup: impl FnOnce() + Send + 'static) {
        lock_unpoisoned(&self.state).cleanup = Some(Box::new(cleanup));
    }

    /// Delivers `value` to a waiting reader, or buffers it.
    ///
    /// Returns `false` when the channel already completed or failed; the
    /// value is dropped in that case.
    pub fn enqueue(&self, value: T) -> bool {
        let mut state = lock_unpoisoned(&self.state);
        if state.done || state.error.is_some() {
            return false;
        }

        if let Some(waiter) = state.waiter.take() {
            match waiter.send(Ok(Some(value))) {
                Ok(()) => return true,
                // The pending read was cancelled; keep the value for the next one.
                Err(Ok(Some(value))) => state.buffer.push_back(value),
                Err(_) => {}
            }
            return true;
        }

        state.buffer.push_back(value);
        true
    }

    /// Marks graceful completion.
    ///
    /// Buffered values stay readable; only a read that is pending right now is
    /// resolved with the completion sentinel.
    pub fn done(&self) {
        let mut state = lock_unpoisoned(&self.state);
        state.done = true;
        state.resolve_waiter(Ok(None));
    }

    /// Records a failure observed by every read once the buffer is drained.
    pub fn error(&self, error: ChannelError) {
        let mut state = lock_unpoisoned(&self.state);
        if state.error.is_none() {
            state.error = Some(error.clone());
        }
        state.resolve_waiter(Err(error));
    }

    /// Forceful termination: marks completion and runs the cleanup callback.
    ///
    /// Idempotent; the callback runs at most once.
    pub fn close(&self) {
        let cleanup = {
            let mut state = lock_unpoisoned(&self.state);
            state.done = true;
            state.resolve_waiter(Ok(None));
            state.cleanup.take()
        };

        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }

    /// Takes the single reader for this channel.
    ///
    /// Precondition: called at most once per channel. A second call is a
    /// caller contract violation and returns [`ChannelError::AlreadyIterated`].
    pub fn reader(&self) -> Result<ChannelReader<T>, ChannelError> {
        let mut state = lock_unpoisoned(&self.state);
        if state.reader_taken {
            return Err(ChannelError::AlreadyIterated);
        }
        state.reader_taken = true;

        Ok(ChannelReader {
            state: Arc::clone(&self.state),
        })
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        lock_unpoisoned(&self.state).done
    }

    /// Returns the number of buffered, not yet consumed values.
    #[must_use]
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.state).buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The single consumer side of a [`StreamChannel`].
pub struct ChannelReader<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> fmt::Debug for ChannelReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelReader").finish_non_exhaustive()
    }
}

impl<T> ChannelReader<T> {
    /// Pulls the next value.
    ///
    /// Returns `Ok(None)` once the channel is done and drained, and the
    /// recorded error once it failed and drained. Otherwise suspends until a
    /// producer acts.
    pub async fn next(&mut self) -> Result<Option<T>, ChannelError> {
        let receiver = {
            let mut state = lock_unpoisoned(&self.state);
            if let Some(value) = state.buffer.pop_front() {
                return Ok(Some(value));
            }
            if state.done {
                return Ok(None);
            }
            if let Some(error) = &state.error {
                return Err(error.clone());
            }

            let (sender, receiver) = oneshot::channel();
            state.waiter = Some(sender);
            receiver
        };

        // The sender is only dropped undelivered if it is replaced, which a
        // single `&mut self` reader cannot do while awaiting.
        receiver.await.unwrap_or(Ok(None))
    }

    /// Early termination from the consumer side; same as [`StreamChannel::close`].
    pub fn close(&self) {
        let cleanup = {
            let mut state = lock_unpoisoned(&self.state);
            state.done = true;
            state.cleanup.take()
        };

        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }

    /// Converts the reader into a `Stream` that ends on completion and yields
    /// the recorded error as its last item.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, ChannelError>> {
        stream::unfold(Some(self), |reader| async move {
            let mut reader = reader?;
            match reader.next().await {
                Ok(Some(value)) => Some((Ok(value), Some(reader))),
                Ok(None) => None,
                Err(error) => Some((Err(error), None)),
            }
        })
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
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn buffered_values_are_returned_in_enqueue_order() {
        let channel = StreamChannel::new();
        let mut reader = channel.reader().expect("first reader should be granted");

        channel.enqueue("a");
        channel.enqueue("b");

        assert_eq!(reader.next().await, Ok(Some("a")));
        assert_eq!(reader.next().await, Ok(Some("b")));
    }

    #[tokio::test]
    async fn pending_read_resolves_with_next_enqueue() {
        let channel = StreamChannel::new();
        let mut reader = channel.reader().expect("first reader should be granted");

        let pending = tokio::spawn(async move { reader.next().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(channel.enqueue("x"));

        let value = pending.await.expect("reader task should not panic");
        assert_eq!(value, Ok(Some("x")));
        assert!(channel.is_empty());
    }

    #[tokio::test]
    async fn done_keeps_buffered_values_and_repeats_completion() {
        let channel = StreamChannel::new();
        let mut reader = channel.reader().expect("first reader should be granted");

        channel.enqueue(1);
        channel.done();

        assert_eq!(reader.next().await, Ok(Some(1)));
        assert_eq!(reader.next().await, Ok(None));
        assert_eq!(reader.next().await, Ok(None));
    }

    #[tokio::test]
    async fn done_resolves_pending_read_with_completion() {
        let channel = StreamChannel::<u32>::new();
        let mut reader = channel.reader().expect("first reader should be granted");

        let pending = tokio::spawn(async move { reader.next().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.done();

        assert_eq!(pending.await.expect("reader task"), Ok(None));
    }

    #[tokio::test]
    async fn error_is_reported_after_buffer_drains_and_stays_sticky() {
        let channel = StreamChannel::new();
        let mut reader = channel.reader().expect("first reader should be granted");

        channel.enqueue("kept");
        channel.error(ChannelError::failed("engine crashed"));

        assert_eq!(reader.next().await, Ok(Some("kept")));
        assert_eq!(
            reader.next().await,
            Err(ChannelError::failed("engine crashed"))
        );
        assert_eq!(
            reader.next().await,
            Err(ChannelError::failed("engine crashed"))
        );
    }

    #[tokio::test]
    async fn error_fails_pending_read() {
        let channel = StreamChannel::<u8>::new();
        let mut reader = channel.reader().expect("first reader should be granted");

        let pending = tokio::spawn(async move { reader.next().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.error(ChannelError::failed("boom"));

        assert_eq!(
            pending.await.expect("reader task"),
            Err(ChannelError::failed("boom"))
        );
    }

    #[test]
    fn second_reader_is_a_usage_error() {
        let channel = StreamChannel::<u8>::new();
        let _reader = channel.reader().expect("first reader should be granted");

        let error = channel.reader().expect_err("second reader must be refused");
        assert_eq!(error, ChannelError::AlreadyIterated);
    }

    #[tokio::test]
    async fn close_runs_cleanup_once_and_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_cleanup = Arc::clone(&calls);
        let channel = StreamChannel::<u8>::with_cleanup(move || {
            calls_for_cleanup.fetch_add(1, Ordering::SeqCst);
        });
        let mut reader = channel.reader().expect("first reader should be granted");

        channel.close();
        channel.close();
        reader.close();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(channel.is_done());
        assert_eq!(reader.next().await, Ok(None));
    }

    #[test]
    fn enqueue_after_completion_is_refused() {
        let channel = StreamChannel::new();
        channel.done();

        assert!(!channel.enqueue(5));
        assert!(channel.is_empty());
    }

    #[tokio::test]
    async fn cancelled_read_does_not_lose_the_next_value() {
        let channel = StreamChannel::new();
        let mut reader = channel.reader().expect("first reader should be granted");

        let timed_out = tokio::time::timeout(Duration::from_millis(5), reader.next()).await;
        assert!(timed_out.is_err());

        channel.enqueue("late");
        assert_eq!(reader.next().await, Ok(Some("late")));
    }
}
