//! Server half of the session bridge.
//!
//! The orchestrator keeps one long-lived engine channel per UI session,
//! forwards engine events over a [`Transport`], and correlates tool
//! permission prompts with the UI's answers. Collaborators for credentials,
//! assets, file search and transcript history are injected as traits.

mod collaborators;
mod error;
mod permissions;
mod protocol;
mod registry;
mod service;
mod transport;

pub use collaborators::{
    AssetCatalog, AssetEntry, AssetKind, CollaboratorError, CredentialStore,
    DirectoryAssetCatalog, FileMatch, FileSearch, HistoryEntry, ProjectsHistory, ProviderProfile,
    SessionHistory, StaticCredentialStore, WalkFileSearch,
};
pub use error::OrchestratorError;
pub use permissions::{
    ChannelAuthorizer, PendingPermissions, PermissionRequest, CHANNEL_CLOSED_REASON,
};
pub use protocol::{
    CloseReason, Envelope, ListAssetsParams, PermissionResponseParams, Request, SearchFilesParams,
    SendMessageParams, ServerEvent, SessionParams, SetModelParams, SetPermissionModeParams,
    StartSessionParams, DEFAULT_SEARCH_LIMIT, RESPONSE_SUFFIX,
};
pub use registry::{ChannelEntry, ChannelRegistry};
pub use service::{SessionDefaults, SessionOrchestrator, INTERRUPTED_HOOK_REASON};
pub use transport::{InMemoryTransport, MessageHandler, Transport};
