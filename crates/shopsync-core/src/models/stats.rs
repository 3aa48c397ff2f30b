//! Sync statistics snapshot

use serde::Serialize;

use crate::state::OrchestratorState;

/// Counts surfaced to the UI, always computed from cached state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatistics {
    /// Entities with local changes waiting to be pushed
    pub pending: usize,
    /// Entities currently being pushed
    pub syncing: usize,
    pub synced: usize,
    /// Open conflict records
    pub conflicts: usize,
    /// Entities whose operations exhausted their retries
    pub failed: usize,
    /// Operations still eligible for draining
    pub queued_operations: usize,
    /// Unix ms of the last completed sync pass
    pub last_sync_time: Option<i64>,
    pub state: OrchestratorState,
}
