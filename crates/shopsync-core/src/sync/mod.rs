//! Reconciliation with the remote sync service.

#[cfg(test)]
pub(crate) mod fake;
mod http;
mod orchestrator;
mod remote;

pub use http::{CredentialProvider, HttpRemote, StaticToken, DEFAULT_REQUEST_TIMEOUT};
pub use orchestrator::{
    OrchestratorConfig, SyncOrchestrator, SyncOutcome, SyncReport, DEFAULT_BATCH_SIZE,
    DEFAULT_SYNC_INTERVAL,
};
pub use remote::{
    PullRequest, PullResponse, PushOperation, PushRequest, PushResponse, PushResult,
    RemoteError, RemoteRecord, RemoteResult, RemoteSync,
};
