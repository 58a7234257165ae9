//! Client-side projection of orchestrator sessions.
//!
//! [`Session`] mirrors one channel's event stream (transcript, busy state,
//! permission queue, usage) and only writes back through [`SessionHost`].
//! [`OrchestratorClient`] owns the client end of the transport and keeps the
//! projections current.

mod client;
mod error;
mod session;

pub use client::OrchestratorClient;
pub use error::ClientError;
pub use session::{Activity, Session, SessionHost};
