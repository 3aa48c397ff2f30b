//! In-memory mirror of known entities with per-type change notification.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::models::{Entity, EntityId, EntityKey, EntityType, SyncState};

/// Change delivered to subscribers of an entity type
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Upserted(Entity),
    Removed(EntityKey),
}

impl CacheEvent {
    pub const fn entity_type(&self) -> EntityType {
        match self {
            Self::Upserted(entity) => entity.entity_type,
            Self::Removed(key) => key.entity_type,
        }
    }
}

/// Callback invoked synchronously for every change of the subscribed type
pub type Subscriber = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

/// Handle returned by [`EntityCache::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Inner {
    entities: HashMap<EntityType, BTreeMap<EntityId, Entity>>,
    subscribers: HashMap<EntityType, Vec<(SubscriptionId, Subscriber)>>,
}

/// Notifications owed for changes already applied by [`EntityCache::stage`]
#[must_use]
pub(crate) struct StagedEvents(Vec<(Vec<Subscriber>, CacheEvent)>);

impl StagedEvents {
    pub(crate) fn deliver(self) {
        for (listeners, event) in self.0 {
            EntityCache::notify(&listeners, &event);
        }
    }
}

/// Exactly one record per `(type, id)`; readers get clones, never references.
#[derive(Clone, Default)]
pub struct EntityCache {
    inner: Arc<RwLock<Inner>>,
    next_subscription: Arc<AtomicU64>,
}

impl EntityCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned lock only means a subscriber panicked elsewhere; the map itself
    // is always left consistent, so keep serving it.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Insert or replace an entity and notify subscribers of its type
    pub fn upsert(&self, entity: Entity) {
        self.stage(vec![CacheEvent::Upserted(entity)]).deliver();
    }

    /// Apply `changes` in order under one write lock.
    ///
    /// Subscribers are not called here; the caller delivers the returned
    /// notifications once it has released its own locks. A removal of an
    /// absent entity produces no notification.
    pub(crate) fn stage(&self, changes: Vec<CacheEvent>) -> StagedEvents {
        let mut inner = self.write();
        let mut staged = Vec::with_capacity(changes.len());
        for change in changes {
            let applied = match &change {
                CacheEvent::Upserted(entity) => {
                    inner
                        .entities
                        .entry(entity.entity_type)
                        .or_default()
                        .insert(entity.id.clone(), entity.clone());
                    true
                }
                CacheEvent::Removed(key) => inner
                    .entities
                    .get_mut(&key.entity_type)
                    .and_then(|entities| entities.remove(&key.id))
                    .is_some(),
            };
            if applied {
                staged.push((Self::listeners(&inner, change.entity_type()), change));
            }
        }
        StagedEvents(staged)
    }

    /// Remove an entity; subscribers are notified only if it was present
    pub fn remove(&self, entity_type: EntityType, id: &EntityId) -> Option<Entity> {
        let (removed, listeners) = {
            let mut inner = self.write();
            let removed = inner
                .entities
                .get_mut(&entity_type)
                .and_then(|entities| entities.remove(id));
            let listeners = if removed.is_some() {
                Self::listeners(&inner, entity_type)
            } else {
                Vec::new()
            };
            (removed, listeners)
        };
        if removed.is_some() {
            Self::notify(
                &listeners,
                &CacheEvent::Removed(EntityKey::new(entity_type, id.clone())),
            );
        }
        removed
    }

    pub fn get(&self, entity_type: EntityType, id: &EntityId) -> Option<Entity> {
        self.read()
            .entities
            .get(&entity_type)
            .and_then(|entities| entities.get(id))
            .cloned()
    }

    /// Point-in-time copy of every entity of `entity_type`, ordered by id
    pub fn snapshot(&self, entity_type: EntityType) -> Vec<Entity> {
        self.read()
            .entities
            .get(&entity_type)
            .map(|entities| entities.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscribe(
        &self,
        entity_type: EntityType,
        callback: impl Fn(&CacheEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.write()
            .subscribers
            .entry(entity_type)
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Returns whether the subscription existed
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        let mut inner = self.write();
        let mut removed = false;
        for subscribers in inner.subscribers.values_mut() {
            let before = subscribers.len();
            subscribers.retain(|(id, _)| *id != subscription);
            removed |= subscribers.len() != before;
        }
        removed
    }

    /// Replace the whole contents without notifying anyone.
    ///
    /// Used at start-up, before any subscriber or mutation exists.
    pub fn rebuild(&self, entities: impl IntoIterator<Item = Entity>) {
        let mut inner = self.write();
        inner.entities.clear();
        for entity in entities {
            inner
                .entities
                .entry(entity.entity_type)
                .or_default()
                .insert(entity.id.clone(), entity);
        }
    }

    /// Number of cached entities per sync state
    pub fn count_by_state(&self) -> HashMap<SyncState, usize> {
        let inner = self.read();
        let mut counts = HashMap::new();
        for entity in inner.entities.values().flat_map(BTreeMap::values) {
            *counts.entry(entity.sync_state).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.read().entities.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn listeners(inner: &Inner, entity_type: EntityType) -> Vec<Subscriber> {
        inner
            .subscribers
            .get(&entity_type)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .map(|(_, callback)| Arc::clone(callback))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn notify(listeners: &[Subscriber], event: &CacheEvent) {
        for callback in listeners {
            callback(event);
        }
    }
}

impl std::fmt::Debug for EntityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCache")
            .field("entities", &self.len())
            .finish_non_exhaustive()
    }
}
