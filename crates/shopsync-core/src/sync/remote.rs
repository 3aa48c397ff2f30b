//! Contract with the remote sync service.

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{
    ChangeOperation, Entity, EntityId, EntityType, OperationId, OperationKind, Origin, Payload,
    SyncState,
};

/// Failure talking to the remote sync service
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Remote service unreachable: {0}")]
    Network(String),
    #[error("Remote request timed out")]
    Timeout,
    #[error("Remote refused credentials: {0}")]
    Unauthorized(String),
    #[error("Remote rejected request: {0}")]
    Rejected(String),
    #[error("Invalid remote payload: {0}")]
    InvalidPayload(String),
    #[error("Invalid remote configuration: {0}")]
    InvalidConfiguration(String),
}

impl RemoteError {
    /// Connectivity-level failures abort the pass and are retried on the next trigger
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout | Self::Unauthorized(_))
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_decode() {
            Self::InvalidPayload(error.to_string())
        } else if error.is_builder() {
            Self::InvalidConfiguration(error.to_string())
        } else {
            Self::Network(error.to_string())
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub entity_type: EntityType,
    /// Server timestamp of the previous pull of this type
    pub since: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    #[serde(default)]
    pub records: Vec<RemoteRecord>,
    pub server_timestamp: i64,
}

/// Entity as the remote describes it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub id: EntityId,
    #[serde(default)]
    pub payload: Payload,
    pub version: i64,
    #[serde(default)]
    pub last_modified_at: Option<i64>,
    /// Tombstone: the entity was deleted remotely
    #[serde(default)]
    pub deleted: bool,
}

impl RemoteRecord {
    /// Local representation; `observed_at` stands in for a missing modification time
    pub fn into_entity(self, entity_type: EntityType, observed_at: i64) -> Entity {
        Entity {
            entity_type,
            id: self.id,
            payload: self.payload,
            version: self.version,
            remote_version: Some(self.version),
            sync_state: SyncState::Synced,
            last_modified_at: self.last_modified_at.unwrap_or(observed_at),
            origin: Origin::Remote,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushOperation {
    pub op_id: OperationId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub kind: OperationKind,
    pub payload: Payload,
    pub base_version: Option<i64>,
}

impl From<&ChangeOperation> for PushOperation {
    fn from(op: &ChangeOperation) -> Self {
        Self {
            op_id: op.op_id.clone(),
            entity_type: op.entity_type,
            entity_id: op.entity_id.clone(),
            kind: op.kind,
            payload: op.payload_delta.clone(),
            base_version: op.base_version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub operations: Vec<PushOperation>,
}

impl PushRequest {
    pub fn from_operations(operations: &[ChangeOperation]) -> Self {
        Self {
            operations: operations.iter().map(PushOperation::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    #[serde(default)]
    pub results: Vec<PushResult>,
}

/// Per-operation outcome of a push
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    pub op_id: OperationId,
    pub success: bool,
    #[serde(default)]
    pub conflict: bool,
    #[serde(default)]
    pub server_version: Option<i64>,
    /// Current remote state of the entity when `conflict` is set
    #[serde(default)]
    pub server_record: Option<RemoteRecord>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PushResult {
    pub const fn accepted(op_id: OperationId, server_version: i64) -> Self {
        Self {
            op_id,
            success: true,
            conflict: false,
            server_version: Some(server_version),
            server_record: None,
            error: None,
        }
    }

    pub fn rejected(op_id: OperationId, error: impl Into<String>) -> Self {
        Self {
            op_id,
            success: false,
            conflict: false,
            server_version: None,
            server_record: None,
            error: Some(error.into()),
        }
    }

    pub const fn conflicting(op_id: OperationId, server_record: RemoteRecord) -> Self {
        Self {
            op_id,
            success: false,
            conflict: true,
            server_version: Some(server_record.version),
            server_record: Some(server_record),
            error: None,
        }
    }
}

/// Remote source of truth the orchestrator reconciles against.
pub trait RemoteSync: Send + Sync {
    /// Records of one type changed since `request.since`
    fn pull(&self, request: PullRequest) -> impl Future<Output = RemoteResult<PullResponse>> + Send;

    /// Submit a batch of operations; results are matched by `opId`
    fn push(&self, request: PushRequest) -> impl Future<Output = RemoteResult<PushResponse>> + Send;
}
