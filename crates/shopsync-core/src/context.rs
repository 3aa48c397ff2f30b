//! Entry point wiring the store, cache, queue and orchestrator together.
//!
//! Clients build one [`SyncContext`] per database and route every read and
//! write through it. Writes are persisted with their queued operation in a
//! single transaction; the cache is updated before the store is released and
//! subscribers are notified afterwards.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;

use crate::cache::{CacheEvent, EntityCache, SubscriptionId};
use crate::config::SyncSettings;
use crate::db::{EntityRepository, SqliteConflictRepository, SqliteEntityRepository};
use crate::models::{
    ChangeOperation, ConflictId, ConflictRecord, Entity, EntityId, EntityKey, EntityType,
    ManualChoice, OperationId, OperationKind, Origin, Payload, SyncState, SyncStatistics,
};
use crate::queue::ChangeQueue;
use crate::resolver::ConflictResolver;
use crate::state::OrchestratorState;
use crate::store::LocalStore;
use crate::sync::{RemoteSync, SyncOrchestrator, SyncOutcome};
use crate::util::now_millis;
use crate::{Error, Result};

pub struct SyncContext<R> {
    store: LocalStore,
    cache: EntityCache,
    queue: ChangeQueue,
    orchestrator: Arc<SyncOrchestrator<R>>,
}

impl<R: RemoteSync> SyncContext<R> {
    /// Build a context over `store`, releasing work interrupted by a previous
    /// shutdown and warming the cache from disk.
    pub fn open(store: LocalStore, remote: R, settings: &SyncSettings) -> Result<Self> {
        settings.validate()?;
        let cache = EntityCache::new();
        let queue = ChangeQueue::new(store.clone(), settings.queue_config());
        let resolver = ConflictResolver::new(&settings.resolver_config())?;
        let orchestrator = SyncOrchestrator::new(
            remote,
            store.clone(),
            cache.clone(),
            queue.clone(),
            resolver,
            settings.orchestrator_config(),
        );

        let released = orchestrator.recover_interrupted()?;
        cache.rebuild(store.load_all()?);
        tracing::info!(
            entities = cache.len(),
            released,
            "Sync context ready"
        );

        Ok(Self {
            store,
            cache,
            queue,
            orchestrator: Arc::new(orchestrator),
        })
    }

    pub const fn store(&self) -> &LocalStore {
        &self.store
    }

    pub const fn queue(&self) -> &ChangeQueue {
        &self.queue
    }

    /// Shared handle for driving [`SyncOrchestrator::run`] on a background task
    pub fn orchestrator(&self) -> Arc<SyncOrchestrator<R>> {
        Arc::clone(&self.orchestrator)
    }

    /// Record a local write and queue it for the remote.
    ///
    /// `create` fails for an existing entity; `update` and `delete` fail for
    /// a missing one. An update merges `payload` into the stored fields.
    pub fn enqueue_change(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        kind: OperationKind,
        payload: Payload,
    ) -> Result<OperationId> {
        let key = EntityKey::new(entity_type, id.clone());
        let op_id = self.store.commit_with_cache(&self.cache, |conn| {
            let entities = SqliteEntityRepository::new(conn);
            let existing = entities.get(entity_type, id)?;
            match kind {
                OperationKind::Create => {
                    if existing.is_some() {
                        return Err(Error::InvalidInput(format!("{key} already exists")));
                    }
                    let entity = Entity::new_local(entity_type, id.clone(), payload.clone());
                    let stored = entities.put(&entity)?;
                    let op_id = self.queue.enqueue_in(conn, kind, &key, payload, None)?;
                    Ok((op_id, vec![CacheEvent::Upserted(stored)]))
                }
                OperationKind::Update => {
                    let mut entity =
                        existing.ok_or_else(|| Error::NotFound(key.to_string()))?;
                    entity.payload.extend(payload.clone());
                    entity.origin = Origin::Local;
                    entity.last_modified_at = now_millis();
                    if entity.sync_state != SyncState::Conflict {
                        entity.sync_state = SyncState::Pending;
                    }
                    let stored = entities.put(&entity)?;
                    let op_id =
                        self.queue
                            .enqueue_in(conn, kind, &key, payload, entity.remote_version)?;
                    Ok((op_id, vec![CacheEvent::Upserted(stored)]))
                }
                OperationKind::Delete => {
                    let entity = existing.ok_or_else(|| Error::NotFound(key.to_string()))?;
                    entities.delete(entity_type, id)?;
                    let conflicts = SqliteConflictRepository::new(conn);
                    if let Some(open) = conflicts.get_for_entity(&key)? {
                        conflicts.delete(&open.id)?;
                    }
                    let op_id = self.queue.enqueue_in(
                        conn,
                        kind,
                        &key,
                        Payload::new(),
                        entity.remote_version,
                    )?;
                    Ok((op_id, vec![CacheEvent::Removed(key.clone())]))
                }
            }
        })?;

        tracing::debug!(%op_id, entity = %key, kind = kind.as_str(), "Queued local change");
        Ok(op_id)
    }

    pub fn get_entity(&self, entity_type: EntityType, id: &EntityId) -> Option<Entity> {
        self.cache.get(entity_type, id)
    }

    /// Current entities of one type, ordered by id
    pub fn snapshot(&self, entity_type: EntityType) -> Vec<Entity> {
        self.cache.snapshot(entity_type)
    }

    pub fn subscribe(
        &self,
        entity_type: EntityType,
        callback: impl Fn(&CacheEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.cache.subscribe(entity_type, callback)
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        self.cache.unsubscribe(subscription)
    }

    /// Conflicts waiting for a manual decision or the next pass
    pub fn get_pending_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        self.store.list_conflicts(None)
    }

    pub fn resolve_conflict_manually(
        &self,
        conflict_id: &ConflictId,
        choice: ManualChoice,
        custom_payload: Option<Payload>,
    ) -> Result<Entity> {
        self.orchestrator
            .resolve_manually(conflict_id, choice, custom_payload)
    }

    /// Counts for status displays.
    ///
    /// Entity counts come from the cache; queue and conflict counts fall back
    /// to zero when the database cannot be read.
    pub fn get_sync_statistics(&self) -> SyncStatistics {
        let by_state = self.cache.count_by_state();
        let count = |state: SyncState| by_state.get(&state).copied().unwrap_or(0);

        SyncStatistics {
            pending: count(SyncState::Pending),
            syncing: count(SyncState::Syncing),
            synced: count(SyncState::Synced),
            conflicts: self.store.conflict_count().unwrap_or_else(|error| {
                tracing::warn!(%error, "Failed to count conflicts");
                0
            }),
            failed: count(SyncState::Failed),
            queued_operations: self.queue.pending_count().unwrap_or_else(|error| {
                tracing::warn!(%error, "Failed to count queued operations");
                0
            }),
            last_sync_time: self.store.last_sync_time().unwrap_or_else(|error| {
                tracing::warn!(%error, "Failed to read last sync time");
                None
            }),
            state: self.orchestrator.state(),
        }
    }

    pub fn failed_operations(&self) -> Result<Vec<ChangeOperation>> {
        self.queue.failed_operations(None)
    }

    /// Requeue an exhausted operation and mark its entity pending again
    pub fn retry_failed_operation(&self, op_id: &OperationId) -> Result<ChangeOperation> {
        let op = self.queue.retry_failed(op_id)?;
        self.store.commit_with_cache(&self.cache, |conn| {
            let entities = SqliteEntityRepository::new(conn);
            let failed = entities
                .get(op.entity_type, &op.entity_id)?
                .is_some_and(|entity| entity.sync_state == SyncState::Failed);
            if !failed {
                return Ok(((), Vec::new()));
            }
            let updated =
                entities.set_sync_state(op.entity_type, &op.entity_id, SyncState::Pending, None)?;
            Ok(((), updated.into_iter().map(CacheEvent::Upserted).collect()))
        })?;
        Ok(op)
    }

    pub fn cache_set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<()> {
        self.store.cache_set(key, value, ttl)
    }

    pub fn cache_get(&self, key: &str) -> Result<Option<Value>> {
        self.store.cache_get(key)
    }

    pub fn purge_expired_cache(&self) -> Result<usize> {
        self.store.purge_expired_cache()
    }

    pub fn state(&self) -> OrchestratorState {
        self.orchestrator.state()
    }

    pub fn set_online(&self, online: bool) {
        self.orchestrator.set_online(online);
    }

    pub async fn sync_now(&self) -> Result<SyncOutcome> {
        self.orchestrator.sync_now().await
    }

    /// Follow `connectivity` until its sender is dropped
    pub async fn run(&self, connectivity: watch::Receiver<bool>) {
        self.orchestrator.run(connectivity).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::fake::FakeRemote;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;

    fn payload(value: Value) -> Payload {
        value.as_object().unwrap().clone()
    }

    fn context(remote: &FakeRemote) -> SyncContext<FakeRemote> {
        let store = LocalStore::open_in_memory().unwrap();
        SyncContext::open(store, remote.clone(), &SyncSettings::default()).unwrap()
    }

    #[test]
    fn create_update_delete_follow_the_entity() {
        let ctx = context(&FakeRemote::default());
        let id: EntityId = "cust-1".parse().unwrap();

        ctx.enqueue_change(
            EntityType::Customer,
            &id,
            OperationKind::Create,
            payload(json!({"name": "Ana", "phone": "555"})),
        )
        .unwrap();
        ctx.enqueue_change(
            EntityType::Customer,
            &id,
            OperationKind::Update,
            payload(json!({"phone": "556"})),
        )
        .unwrap();

        let entity = ctx.get_entity(EntityType::Customer, &id).unwrap();
        assert_eq!(entity.payload, payload(json!({"name": "Ana", "phone": "556"})));
        assert_eq!(entity.sync_state, SyncState::Pending);
        assert_eq!(entity.version, 2);
        assert_eq!(ctx.store().get(EntityType::Customer, &id).unwrap(), Some(entity));
        // update coalesced into the queued create
        assert_eq!(ctx.queue().pending_count().unwrap(), 1);

        ctx.enqueue_change(EntityType::Customer, &id, OperationKind::Delete, Payload::new())
            .unwrap();
        assert!(ctx.get_entity(EntityType::Customer, &id).is_none());
        assert!(ctx.store().get(EntityType::Customer, &id).unwrap().is_none());
        // the remote never saw the create, so nothing is left to send
        assert!(ctx.queue().peek_batch(10).unwrap().is_empty());
    }

    #[test]
    fn rejects_writes_that_do_not_match_the_store() {
        let ctx = context(&FakeRemote::default());
        let id: EntityId = "veh-1".parse().unwrap();

        assert!(matches!(
            ctx.enqueue_change(EntityType::Vehicle, &id, OperationKind::Update, Payload::new()),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            ctx.enqueue_change(EntityType::Vehicle, &id, OperationKind::Delete, Payload::new()),
            Err(Error::NotFound(_))
        ));

        ctx.enqueue_change(EntityType::Vehicle, &id, OperationKind::Create, Payload::new())
            .unwrap();
        assert!(matches!(
            ctx.enqueue_change(EntityType::Vehicle, &id, OperationKind::Create, Payload::new()),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(ctx.queue().pending_count().unwrap(), 1);
    }

    #[test]
    fn subscribers_see_local_writes() {
        let ctx = context(&FakeRemote::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = ctx.subscribe(EntityType::Invoice, move |event| {
            sink.lock().unwrap().push(event.clone());
        });

        let id: EntityId = "inv-1".parse().unwrap();
        ctx.enqueue_change(
            EntityType::Invoice,
            &id,
            OperationKind::Create,
            payload(json!({"total": 120})),
        )
        .unwrap();
        ctx.enqueue_change(
            EntityType::Customer,
            &"cust-1".parse().unwrap(),
            OperationKind::Create,
            Payload::new(),
        )
        .unwrap();

        assert!(ctx.unsubscribe(subscription));
        ctx.enqueue_change(EntityType::Invoice, &id, OperationKind::Delete, Payload::new())
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], CacheEvent::Upserted(entity) if entity.id == id));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deleting_an_unsent_create_never_reaches_the_remote() {
        let remote = FakeRemote::default();
        let ctx = context(&remote);
        let id: EntityId = "cust-9".parse().unwrap();

        ctx.enqueue_change(
            EntityType::Customer,
            &id,
            OperationKind::Create,
            payload(json!({"name": "Caio"})),
        )
        .unwrap();
        ctx.enqueue_change(EntityType::Customer, &id, OperationKind::Delete, Payload::new())
            .unwrap();

        ctx.set_online(true);
        assert!(matches!(ctx.sync_now().await.unwrap(), SyncOutcome::Completed(_)));
        assert!(remote.pushed().is_empty());
        assert_eq!(ctx.queue().pending_count().unwrap(), 0);
        assert!(remote
            .record(&EntityKey::new(EntityType::Customer, id))
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_writes_racing_sync_passes_are_not_lost() {
        const WRITES: i64 = 200;
        const REMOTE_EDITS: i64 = 20;

        let remote = FakeRemote::default();
        let store = LocalStore::open_in_memory().unwrap();
        let settings = SyncSettings {
            always_local_fields: [(EntityType::Customer, vec!["^counter$".to_string()])].into(),
            ..SyncSettings::default()
        };
        let ctx = Arc::new(SyncContext::open(store, remote.clone(), &settings).unwrap());
        let id: EntityId = "cust-1".parse().unwrap();
        let key = EntityKey::new(EntityType::Customer, id.clone());

        ctx.enqueue_change(
            EntityType::Customer,
            &id,
            OperationKind::Create,
            payload(json!({"name": "Ana", "counter": -1})),
        )
        .unwrap();
        ctx.set_online(true);
        ctx.sync_now().await.unwrap();

        let writer = {
            let ctx = Arc::clone(&ctx);
            let id = id.clone();
            std::thread::spawn(move || {
                for counter in 0..WRITES {
                    ctx.enqueue_change(
                        EntityType::Customer,
                        &id,
                        OperationKind::Update,
                        payload(json!({"counter": counter})),
                    )
                    .unwrap();
                }
            })
        };

        // Another client keeps editing a different field meanwhile.
        for edit in 0..REMOTE_EDITS {
            let mut record = remote.record(&key).unwrap();
            record.version += 1;
            record.payload.insert("bay".to_string(), json!(edit));
            remote.seed(EntityType::Customer, record);
            ctx.sync_now().await.unwrap();
        }
        writer.join().unwrap();
        ctx.sync_now().await.unwrap();
        ctx.sync_now().await.unwrap();

        let stored = ctx.store().get(EntityType::Customer, &id).unwrap().unwrap();
        assert_eq!(ctx.get_entity(EntityType::Customer, &id), Some(stored.clone()));
        assert_eq!(stored.payload["counter"], WRITES - 1);
        assert_eq!(stored.payload["bay"], REMOTE_EDITS - 1);
        assert_eq!(stored.sync_state, SyncState::Synced);
        assert_eq!(ctx.queue().pending_count().unwrap(), 0);

        let server = remote.record(&key).unwrap();
        assert_eq!(server.payload["counter"], WRITES - 1);
        assert_eq!(stored.remote_version, Some(server.version));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn statistics_track_queue_and_passes() {
        let remote = FakeRemote::default();
        let ctx = context(&remote);
        let stats = ctx.get_sync_statistics();
        assert_eq!(stats.state, OrchestratorState::Offline);
        assert_eq!(stats.last_sync_time, None);

        ctx.enqueue_change(
            EntityType::Payment,
            &"pay-1".parse().unwrap(),
            OperationKind::Create,
            payload(json!({"amount": 40})),
        )
        .unwrap();
        let stats = ctx.get_sync_statistics();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.queued_operations, 1);

        ctx.set_online(true);
        let outcome = ctx.sync_now().await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Completed(_)));

        let stats = ctx.get_sync_statistics();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.synced, 1);
        assert_eq!(stats.queued_operations, 0);
        assert_eq!(stats.state, OrchestratorState::Idle);
        assert!(stats.last_sync_time.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_operation_can_be_retried() {
        let remote = FakeRemote::default();
        let store = LocalStore::open_in_memory().unwrap();
        let settings = SyncSettings {
            max_retries: 1,
            ..SyncSettings::default()
        };
        let ctx = SyncContext::open(store, remote.clone(), &settings).unwrap();
        let id: EntityId = "so-1".parse().unwrap();
        let key = EntityKey::new(EntityType::ServiceOrder, id.clone());
        remote.reject_on(key.clone(), "missing customer");

        ctx.enqueue_change(EntityType::ServiceOrder, &id, OperationKind::Create, Payload::new())
            .unwrap();
        ctx.set_online(true);
        ctx.sync_now().await.unwrap();

        let failed = ctx.failed_operations().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(
            ctx.get_entity(EntityType::ServiceOrder, &id).unwrap().sync_state,
            SyncState::Failed
        );
        assert_eq!(ctx.get_sync_statistics().failed, 1);

        ctx.retry_failed_operation(&failed[0].op_id).unwrap();
        assert_eq!(
            ctx.get_entity(EntityType::ServiceOrder, &id).unwrap().sync_state,
            SyncState::Pending
        );

        remote.clear_rejection(&key);
        ctx.sync_now().await.unwrap();
        assert_eq!(
            ctx.get_entity(EntityType::ServiceOrder, &id).unwrap().sync_state,
            SyncState::Synced
        );
        assert!(ctx.failed_operations().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_writes_survive_restart_and_push_once() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("shopsync.db");
        let remote = FakeRemote::default();
        let id: EntityId = "cust-9".parse().unwrap();

        {
            let store = LocalStore::open_path(&db_path).unwrap();
            let ctx = SyncContext::open(store, remote.clone(), &SyncSettings::default()).unwrap();
            ctx.enqueue_change(
                EntityType::Customer,
                &id,
                OperationKind::Create,
                payload(json!({"name": "Bruno"})),
            )
            .unwrap();
            ctx.enqueue_change(
                EntityType::Customer,
                &id,
                OperationKind::Update,
                payload(json!({"email": "bruno@example.com"})),
            )
            .unwrap();
            assert_eq!(ctx.sync_now().await.unwrap(), SyncOutcome::Offline);
        }

        let store = LocalStore::open_path(&db_path).unwrap();
        let ctx = SyncContext::open(store, remote.clone(), &SyncSettings::default()).unwrap();
        assert_eq!(
            ctx.get_entity(EntityType::Customer, &id).unwrap().sync_state,
            SyncState::Pending
        );

        ctx.set_online(true);
        ctx.sync_now().await.unwrap();
        ctx.sync_now().await.unwrap();

        let pushed = remote.pushed();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].kind, OperationKind::Create);
        assert_eq!(
            pushed[0].payload,
            payload(json!({"name": "Bruno", "email": "bruno@example.com"}))
        );

        let entity = ctx.get_entity(EntityType::Customer, &id).unwrap();
        assert_eq!(entity.sync_state, SyncState::Synced);
        assert_eq!(entity.remote_version, Some(1));
        assert_eq!(ctx.store().get(EntityType::Customer, &id).unwrap(), Some(entity));
    }
}
