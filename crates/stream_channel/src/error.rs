use thiserror::Error;

/// Failure observed by a [`crate::ChannelReader`] or raised on misuse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// A second reader was requested; the channel is not replayable.
    #[error("stream channel can only be iterated once")]
    AlreadyIterated,

    /// A producer recorded a failure with [`crate::StreamChannel::error`].
    #[error("{0}")]
    Failed(String),
}

impl ChannelError {
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}
