use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] shopsync_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Expected a JSON object for {0}")]
    NotAnObject(&'static str),
    #[error("Entity not found: {0}")]
    EntityNotFound(String),
    #[error("Cache key not found: {0}")]
    CacheMiss(String),
    #[error("Sync failed: {0}")]
    SyncAborted(String),
    #[error(
        "Sync is not configured. Set remote_base_url in the settings file or SHOPSYNC_REMOTE_URL."
    )]
    SyncNotConfigured,
}
