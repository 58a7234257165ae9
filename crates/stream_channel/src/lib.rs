//! Single-consumer async channel used to pump session traffic.
//!
//! Producers hold cloneable [`StreamChannel`] handles and never block. Exactly
//! one [`ChannelReader`] can be taken from a channel; it yields values in
//! enqueue order and observes completion or failure only after every buffered
//! value has been drained.
//!
//! Completion is signalled manually with [`StreamChannel::done`] (graceful) or
//! [`StreamChannel::close`] (forceful, runs the registered cleanup callback).

mod channel;
mod error;

pub use channel::{ChannelReader, StreamChannel};
pub use error::ChannelError;
