//! Reactive transcript model and the reconciliation algorithms that keep it
//! coherent while engine events arrive out of step with each other.

mod coalesce;
mod convert;
mod message;
mod signal;
mod transcript;

pub use coalesce::{coalesce_read_calls, COALESCED_READ_TOOL, READ_TOOL};
pub use convert::{convert_event, INTERRUPT_MARKERS};
pub use message::{ContentBlockWrapper, Message, MessageContent, Role};
pub use signal::{Signal, Subscription};
pub use transcript::{associate_tool_result, ApplyOutcome, Transcript};
