//! Entity record model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// Opaque business fields of an entity.
///
/// The core only ever looks at top-level field names (for merge rules); the
/// values themselves are never interpreted.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Category of a synchronized business record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    ServiceOrder,
    Customer,
    Vehicle,
    Technician,
    Bay,
    Invoice,
    Payment,
    InventoryItem,
}

impl EntityType {
    /// Every entity type, in declaration order
    pub const ALL: [Self; 8] = [
        Self::ServiceOrder,
        Self::Customer,
        Self::Vehicle,
        Self::Technician,
        Self::Bay,
        Self::Invoice,
        Self::Payment,
        Self::InventoryItem,
    ];

    /// Stable storage/wire name
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ServiceOrder => "service_order",
            Self::Customer => "customer",
            Self::Vehicle => "vehicle",
            Self::Technician => "technician",
            Self::Bay => "bay",
            Self::Invoice => "invoice",
            Self::Payment => "payment",
            Self::InventoryItem => "inventory_item",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|entity_type| entity_type.as_str() == normalized)
            .ok_or_else(|| Error::InvalidInput(format!("unknown entity type: {s}")))
    }
}

/// Identifier of an entity, unique within its type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Generate a new time-sortable identifier (UUID v7)
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Get the string representation of this ID
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("entity id cannot be empty".into()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// `(type, id)` pair identifying exactly one entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub id: EntityId,
}

impl EntityKey {
    pub const fn new(entity_type: EntityType, id: EntityId) -> Self {
        Self { entity_type, id }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.id)
    }
}

/// Per-entity sync lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    Syncing,
    Synced,
    Conflict,
    Failed,
}

impl SyncState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Conflict => "conflict",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for SyncState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "synced" => Ok(Self::Synced),
            "conflict" => Ok(Self::Conflict),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Database(format!("unknown sync state: {other}"))),
        }
    }
}

/// Where the last write of an entity came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Local,
    Remote,
}

impl Origin {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl FromStr for Origin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(Error::Database(format!("unknown origin: {other}"))),
        }
    }
}

/// A business record tracked for offline sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Category, immutable
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    /// Identifier, immutable
    pub id: EntityId,
    /// Business fields
    pub payload: Payload,
    /// Incremented on every local or remote mutation
    pub version: i64,
    /// Last version acknowledged by the remote service
    #[serde(default)]
    pub remote_version: Option<i64>,
    /// Sync lifecycle state
    pub sync_state: SyncState,
    /// Client clock timestamp of the last write (Unix ms)
    pub last_modified_at: i64,
    /// Whether the last write was local or received from the remote
    pub origin: Origin,
}

impl Entity {
    /// A freshly created local entity that has never reached the remote
    #[must_use]
    pub fn new_local(entity_type: EntityType, id: EntityId, payload: Payload) -> Self {
        Self {
            entity_type,
            id,
            payload,
            version: 1,
            remote_version: None,
            sync_state: SyncState::Pending,
            last_modified_at: crate::util::now_millis(),
            origin: Origin::Local,
        }
    }

    /// An entity as received from the remote service
    #[must_use]
    pub const fn from_remote(
        entity_type: EntityType,
        id: EntityId,
        payload: Payload,
        version: i64,
        last_modified_at: i64,
    ) -> Self {
        Self {
            entity_type,
            id,
            payload,
            version,
            remote_version: Some(version),
            sync_state: SyncState::Synced,
            last_modified_at,
            origin: Origin::Remote,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.id.clone())
    }

    /// Whether local writes exist that the remote has not confirmed
    pub const fn has_unsynced_changes(&self) -> bool {
        !matches!(self.sync_state, SyncState::Synced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_type_parse() {
        assert_eq!(
            "service_order".parse::<EntityType>().unwrap(),
            EntityType::ServiceOrder
        );
        assert_eq!(
            "Inventory-Item".parse::<EntityType>().unwrap(),
            EntityType::InventoryItem
        );
        assert!("spaceship".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_entity_type_names_roundtrip() {
        for entity_type in EntityType::ALL {
            assert_eq!(entity_type.as_str().parse::<EntityType>().unwrap(), entity_type);
        }
    }

    #[test]
    fn test_entity_id_rejects_empty() {
        assert!("   ".parse::<EntityId>().is_err());
        assert_eq!("C1".parse::<EntityId>().unwrap().as_str(), "C1");
    }

    #[test]
    fn test_entity_id_generate_unique() {
        assert_ne!(EntityId::generate(), EntityId::generate());
    }

    #[test]
    fn test_new_local_entity() {
        let entity = Entity::new_local(
            EntityType::Customer,
            "C1".parse().unwrap(),
            json!({"name": "Acme"}).as_object().unwrap().clone(),
        );
        assert_eq!(entity.version, 1);
        assert_eq!(entity.remote_version, None);
        assert_eq!(entity.sync_state, SyncState::Pending);
        assert_eq!(entity.origin, Origin::Local);
        assert!(entity.has_unsynced_changes());
        assert_eq!(entity.key().to_string(), "customer/C1");
    }

    #[test]
    fn test_entity_serializes_type_field() {
        let entity = Entity::from_remote(
            EntityType::Bay,
            "B2".parse().unwrap(),
            Payload::new(),
            4,
            1_000,
        );
        let value = serde_json::to_value(&entity).unwrap();
        assert_eq!(value["type"], "bay");
        assert_eq!(value["remoteVersion"], 4);
        assert_eq!(value["syncState"], "synced");
    }
}
