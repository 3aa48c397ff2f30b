//! Sync conflict model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::entity::{Entity, EntityId, EntityKey, EntityType, Payload};
use super::operation::OperationId;
use crate::error::Error;

/// Conflict record identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(String);

impl ConflictId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConflictId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("conflict id cannot be empty".into()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// How a local/remote divergence is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    LocalWins,
    #[default]
    RemoteWins,
    Merge,
    TimestampWins,
    Manual,
}

impl ResolutionStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalWins => "local-wins",
            Self::RemoteWins => "remote-wins",
            Self::Merge => "merge",
            Self::TimestampWins => "timestamp-wins",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "local-wins" => Ok(Self::LocalWins),
            "remote-wins" => Ok(Self::RemoteWins),
            "merge" => Ok(Self::Merge),
            "timestamp-wins" => Ok(Self::TimestampWins),
            "manual" => Ok(Self::Manual),
            other => Err(Error::InvalidInput(format!(
                "unknown resolution strategy: {other}"
            ))),
        }
    }
}

/// Decision supplied by an external actor for a manual conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualChoice {
    /// Keep the local snapshot
    Local,
    /// Accept the remote snapshot
    Remote,
    /// Field-level merge using the entity type's merge rules
    Merge,
    /// Use a caller-supplied payload
    Custom,
}

impl FromStr for ManualChoice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            "merge" => Ok(Self::Merge),
            "custom" => Ok(Self::Custom),
            other => Err(Error::InvalidInput(format!("unknown conflict choice: {other}"))),
        }
    }
}

/// Detected divergence between the local and remote versions of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    /// Local snapshot at detection time
    pub local_version: Entity,
    /// Remote snapshot at detection time
    pub remote_version: Entity,
    /// Unix ms
    pub detected_at: i64,
    pub resolution_strategy: ResolutionStrategy,
    /// Present once resolved
    pub resolved_payload: Option<Payload>,
    /// Pushed operation that the remote reported as conflicting
    pub op_id: Option<OperationId>,
}

impl ConflictRecord {
    #[must_use]
    pub fn new(local: Entity, remote: Entity, strategy: ResolutionStrategy) -> Self {
        Self {
            id: ConflictId::new(),
            entity_type: local.entity_type,
            entity_id: local.id.clone(),
            local_version: local,
            remote_version: remote,
            detected_at: crate::util::now_millis(),
            resolution_strategy: strategy,
            resolved_payload: None,
            op_id: None,
        }
    }

    #[must_use]
    pub fn with_operation(mut self, op_id: OperationId) -> Self {
        self.op_id = Some(op_id);
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse_accepts_both_separators() {
        assert_eq!(
            "timestamp_wins".parse::<ResolutionStrategy>().unwrap(),
            ResolutionStrategy::TimestampWins
        );
        assert_eq!(
            "Local-Wins".parse::<ResolutionStrategy>().unwrap(),
            ResolutionStrategy::LocalWins
        );
        assert!("coin-flip".parse::<ResolutionStrategy>().is_err());
    }

    #[test]
    fn test_strategy_serde_uses_kebab_case() {
        let json = serde_json::to_string(&ResolutionStrategy::RemoteWins).unwrap();
        assert_eq!(json, "\"remote-wins\"");
        assert_eq!(ResolutionStrategy::default(), ResolutionStrategy::RemoteWins);
    }

    #[test]
    fn test_new_conflict_takes_key_from_local() {
        let local = Entity::new_local(EntityType::Invoice, "I9".parse().unwrap(), Payload::new());
        let remote = Entity::from_remote(EntityType::Invoice, "I9".parse().unwrap(), Payload::new(), 3, 0);
        let record = ConflictRecord::new(local, remote, ResolutionStrategy::Manual);
        assert_eq!(record.key().to_string(), "invoice/I9");
        assert!(record.resolved_payload.is_none());
        assert!(record.op_id.is_none());
    }
}
