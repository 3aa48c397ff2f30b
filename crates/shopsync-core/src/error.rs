//! Error types for shopsync-core

use thiserror::Error;

use crate::sync::RemoteError;

/// Result type alias using shopsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in shopsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Local store failure that is not a raw SQLite error (lock poisoning, corrupt rows)
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Entity, operation or conflict not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote sync service error
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error came from the local persistent store.
    ///
    /// Storage failures are fatal for the single operation only; callers retry
    /// the surrounding step instead of treating them as data loss.
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Sqlite(_))
    }

    /// Whether the error is a connectivity-level failure that should abort a
    /// sync pass and be retried on the next trigger.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Remote(error) => error.is_transient(),
            _ => false,
        }
    }
}
