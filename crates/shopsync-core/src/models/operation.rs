//! Change operation model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::entity::{EntityId, EntityKey, EntityType, Payload};
use crate::error::Error;

/// Client-generated operation identifier (UUID v7), echoed by the remote for de-duplication
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OperationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("operation id cannot be empty".into()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Mutation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("unknown operation kind: {other}"))),
        }
    }
}

/// Queue lifecycle of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting to be drained
    Queued,
    /// Submitted in the current sync pass, not yet acknowledged
    InFlight,
    /// Retries exhausted; kept for inspection only
    Failed,
}

impl OperationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InFlight => "in_flight",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for OperationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_flight" => Ok(Self::InFlight),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Database(format!("unknown operation status: {other}"))),
        }
    }
}

/// A queued mutation not yet confirmed by the remote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeOperation {
    pub op_id: OperationId,
    /// Store-assigned enqueue order (0 until persisted)
    pub sequence: i64,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub kind: OperationKind,
    pub payload_delta: Payload,
    /// Remote version the change was made against
    pub base_version: Option<i64>,
    /// Drain tier, lower first
    pub priority: u8,
    pub enqueued_at: i64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub status: OperationStatus,
    /// Earliest time the next attempt may happen (Unix ms)
    pub next_attempt_at: i64,
}

impl ChangeOperation {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }

    /// Whether the operation was never handed to the remote
    pub const fn is_unattempted(&self) -> bool {
        self.retry_count == 0 && matches!(self.status, OperationStatus::Queued)
    }

    pub const fn is_due(&self, now: i64) -> bool {
        matches!(self.status, OperationStatus::Queued) && self.next_attempt_at <= now
    }
}
