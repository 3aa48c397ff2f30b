//! Conflict resolution between a local and a remote snapshot of one entity.
//!
//! Resolution is a pure function of the two snapshots and the configuration;
//! applying the outcome is up to the caller.

use std::collections::{HashMap, HashSet};

use regex::RegexSet;
use serde_json::Value;

use crate::models::{Entity, EntityType, Payload, ResolutionStrategy};
use crate::{Error, Result};

/// Built-in strategy of an entity type
pub const fn default_strategy(entity_type: EntityType) -> ResolutionStrategy {
    match entity_type {
        EntityType::Customer | EntityType::ServiceOrder | EntityType::Vehicle => {
            ResolutionStrategy::Merge
        }
        EntityType::InventoryItem => ResolutionStrategy::TimestampWins,
        EntityType::Technician | EntityType::Bay | EntityType::Invoice | EntityType::Payment => {
            ResolutionStrategy::RemoteWins
        }
    }
}

/// Strategy and merge settings per entity type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Overrides of [`default_strategy`]
    pub strategies: HashMap<EntityType, ResolutionStrategy>,
    /// Regular expressions over top-level field names that always keep the
    /// local value under `merge`
    pub always_local: HashMap<EntityType, Vec<String>>,
}

/// Which side a resolution took its payload from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
    Merged,
}

/// Outcome of [`ConflictResolver::resolve`]
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved { winner: Winner, payload: Payload },
    /// `manual` strategy; waits for an external decision
    Deferred,
}

/// Applies the configured strategy of each entity type
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    strategies: HashMap<EntityType, ResolutionStrategy>,
    always_local: HashMap<EntityType, RegexSet>,
}

impl ConflictResolver {
    /// Compile the configured field patterns
    pub fn new(config: &ResolverConfig) -> Result<Self> {
        let mut always_local = HashMap::new();
        for (entity_type, patterns) in &config.always_local {
            if patterns.is_empty() {
                continue;
            }
            let set = RegexSet::new(patterns).map_err(|error| {
                Error::Config(format!("invalid merge pattern for {entity_type}: {error}"))
            })?;
            always_local.insert(*entity_type, set);
        }

        Ok(Self {
            strategies: config.strategies.clone(),
            always_local,
        })
    }

    pub fn strategy_for(&self, entity_type: EntityType) -> ResolutionStrategy {
        self.strategies
            .get(&entity_type)
            .copied()
            .unwrap_or_else(|| default_strategy(entity_type))
    }

    /// Resolve using the entity type's configured strategy
    pub fn resolve(&self, local: &Entity, remote: &Entity) -> Resolution {
        self.resolve_with(self.strategy_for(local.entity_type), local, remote)
    }

    pub fn resolve_with(
        &self,
        strategy: ResolutionStrategy,
        local: &Entity,
        remote: &Entity,
    ) -> Resolution {
        let (winner, payload) = match strategy {
            ResolutionStrategy::LocalWins => (Winner::Local, local.payload.clone()),
            ResolutionStrategy::RemoteWins => (Winner::Remote, remote.payload.clone()),
            ResolutionStrategy::TimestampWins => {
                if local.last_modified_at > remote.last_modified_at {
                    (Winner::Local, local.payload.clone())
                } else {
                    (Winner::Remote, remote.payload.clone())
                }
            }
            ResolutionStrategy::Merge => (
                Winner::Merged,
                self.merge(local.entity_type, &local.payload, &remote.payload),
            ),
            ResolutionStrategy::Manual => return Resolution::Deferred,
        };
        Resolution::Resolved { winner, payload }
    }

    /// Field-level union of both payloads.
    ///
    /// Always-local fields keep the local value, arrays on both sides are
    /// unioned local-first without duplicates, every other shared field takes
    /// the remote value. Fields present on one side only are kept.
    pub fn merge(&self, entity_type: EntityType, local: &Payload, remote: &Payload) -> Payload {
        let patterns = self.always_local.get(&entity_type);
        let mut merged = local.clone();

        for (field, remote_value) in remote {
            let local_value = local.get(field);
            let value = match (local_value, remote_value) {
                (Some(local_value), _)
                    if patterns.is_some_and(|patterns| patterns.is_match(field)) =>
                {
                    local_value.clone()
                }
                (Some(Value::Array(local_items)), Value::Array(remote_items)) => {
                    Value::Array(union_arrays(local_items, remote_items))
                }
                _ => remote_value.clone(),
            };
            merged.insert(field.clone(), value);
        }

        merged
    }
}

fn union_arrays(local: &[Value], remote: &[Value]) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut items = Vec::with_capacity(local.len() + remote.len());
    for item in local.iter().chain(remote) {
        // Value has no Hash; its canonical JSON text stands in for identity.
        if seen.insert(item.to_string()) {
            items.push(item.clone());
        }
    }
    items
}
