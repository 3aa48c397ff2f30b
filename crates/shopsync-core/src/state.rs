//! Orchestrator state shared with status consumers.

use serde::Serialize;

/// Connectivity-driven state of the sync orchestrator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    #[default]
    Offline,
    Syncing,
    Idle,
}

impl OrchestratorState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Syncing => "syncing",
            Self::Idle => "idle",
        }
    }
}
