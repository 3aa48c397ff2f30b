//! Durable queue of local mutations waiting to reach the remote.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rusqlite::Connection;

use crate::db::{OperationRepository, SqliteOperationRepository};
use crate::models::{
    ChangeOperation, EntityId, EntityKey, EntityType, OperationId, OperationKind,
    OperationStatus, Payload,
};
use crate::store::LocalStore;
use crate::util::{compact_text, now_millis};
use crate::{Error, Result};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);

/// Drain tier of deletes, ahead of every entity type
pub const DELETE_PRIORITY: u8 = 0;

/// Built-in drain tier of an entity type; money moves first.
pub const fn default_priority(entity_type: EntityType) -> u8 {
    match entity_type {
        EntityType::Payment | EntityType::Invoice => 1,
        EntityType::ServiceOrder => 2,
        EntityType::Customer | EntityType::Vehicle => 3,
        EntityType::Technician | EntityType::Bay | EntityType::InventoryItem => 4,
    }
}

/// Retry and ordering settings of the change queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Per-type tier overrides; missing types use [`default_priority`]
    pub priorities: HashMap<EntityType, u8>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            priorities: HashMap::new(),
        }
    }
}

impl QueueConfig {
    pub fn priority_for(&self, kind: OperationKind, entity_type: EntityType) -> u8 {
        if kind == OperationKind::Delete {
            return DELETE_PRIORITY;
        }
        self.priorities
            .get(&entity_type)
            .copied()
            .unwrap_or_else(|| default_priority(entity_type))
    }

    /// Delay before attempt number `retry_count + 1`: `base * 2^(retry_count - 1)`, capped
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let base = u64::try_from(self.backoff_base.as_millis()).unwrap_or(u64::MAX);
        let cap = u64::try_from(self.backoff_cap.as_millis()).unwrap_or(u64::MAX);
        let factor = 1_u64
            .checked_shl(retry_count.saturating_sub(1))
            .unwrap_or(u64::MAX);
        Duration::from_millis(base.saturating_mul(factor).min(cap))
    }
}

/// What [`ChangeQueue::fail`] did with the operation
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Requeued; eligible again at `next_attempt_at` (Unix ms)
    Retrying { retry_count: u32, next_attempt_at: i64 },
    /// Retries exhausted; kept with status `failed`
    Exhausted(ChangeOperation),
    /// The operation no longer exists (superseded by a delete or discarded)
    Gone,
}

/// Ordered, persistent change queue
#[derive(Clone)]
pub struct ChangeQueue {
    store: LocalStore,
    config: QueueConfig,
}

impl ChangeQueue {
    pub const fn new(store: LocalStore, config: QueueConfig) -> Self {
        Self { store, config }
    }

    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Append a mutation, persisted before returning.
    ///
    /// An update folds into the entity's latest never-attempted create/update
    /// and returns that operation's id. A delete drops every other active
    /// operation of the entity. When one of those was a never-attempted create
    /// the remote has never seen the entity, so nothing is queued and the
    /// create's id is returned.
    pub fn enqueue(
        &self,
        kind: OperationKind,
        entity_type: EntityType,
        entity_id: &EntityId,
        payload_delta: Payload,
        base_version: Option<i64>,
    ) -> Result<OperationId> {
        let key = EntityKey::new(entity_type, entity_id.clone());
        self.store
            .transaction(|conn| self.enqueue_in(conn, kind, &key, payload_delta, base_version))
    }

    /// [`ChangeQueue::enqueue`] inside a caller's transaction
    pub(crate) fn enqueue_in(
        &self,
        conn: &Connection,
        kind: OperationKind,
        key: &EntityKey,
        payload_delta: Payload,
        base_version: Option<i64>,
    ) -> Result<OperationId> {
        let repo = SqliteOperationRepository::new(conn);
        match kind {
            OperationKind::Update => {
                let latest = repo.list_active_for_entity(key)?.pop();
                if let Some(mut latest) = latest.filter(|op| {
                    op.is_unattempted()
                        && matches!(op.kind, OperationKind::Create | OperationKind::Update)
                }) {
                    latest.payload_delta.extend(payload_delta);
                    repo.update(&latest)?;
                    tracing::debug!(
                        op_id = %latest.op_id,
                        entity = %key,
                        "Coalesced update into queued operation"
                    );
                    return Ok(latest.op_id);
                }
            }
            OperationKind::Delete => {
                let unsent_create = repo
                    .list_active_for_entity(key)?
                    .into_iter()
                    .find(|op| op.kind == OperationKind::Create && op.is_unattempted());
                let dropped = repo.delete_active_for_entity(key)?;
                if let Some(create) = unsent_create {
                    tracing::debug!(
                        entity = %key,
                        dropped,
                        "Delete cancelled an entity the remote never saw"
                    );
                    return Ok(create.op_id);
                }
                if dropped > 0 {
                    tracing::debug!(entity = %key, dropped, "Delete superseded queued operations");
                }
            }
            OperationKind::Create => {}
        }

        let op = self.insert(conn, kind, key, payload_delta, base_version)?;
        Ok(op.op_id)
    }

    /// Drop the entity's active operations and queue one full-payload update
    /// inside a caller's transaction
    pub(crate) fn replace_in(
        &self,
        conn: &Connection,
        key: &EntityKey,
        payload: Payload,
        base_version: Option<i64>,
    ) -> Result<OperationId> {
        SqliteOperationRepository::new(conn).delete_active_for_entity(key)?;
        let op = self.insert(conn, OperationKind::Update, key, payload, base_version)?;
        Ok(op.op_id)
    }

    fn insert(
        &self,
        conn: &Connection,
        kind: OperationKind,
        key: &EntityKey,
        payload_delta: Payload,
        base_version: Option<i64>,
    ) -> Result<ChangeOperation> {
        let now = now_millis();
        let op = ChangeOperation {
            op_id: OperationId::new(),
            sequence: 0,
            entity_type: key.entity_type,
            entity_id: key.id.clone(),
            kind,
            payload_delta,
            base_version,
            priority: self.config.priority_for(kind, key.entity_type),
            enqueued_at: now,
            retry_count: 0,
            max_retries: self.config.max_retries,
            last_error: None,
            status: OperationStatus::Queued,
            next_attempt_at: now,
        };
        let op = SqliteOperationRepository::new(conn).insert(&op)?;
        tracing::debug!(
            op_id = %op.op_id,
            sequence = op.sequence,
            kind = %op.kind,
            entity = %key,
            "Enqueued change operation"
        );
        Ok(op)
    }

    /// Next due operations ordered by (priority, sequence)
    pub fn peek_batch(&self, max_size: usize) -> Result<Vec<ChangeOperation>> {
        self.peek_batch_excluding(max_size, &HashSet::new())
    }

    /// Like [`ChangeQueue::peek_batch`], skipping `excluded` operations.
    ///
    /// At most one operation per entity is returned, and only when no earlier
    /// operation of that entity is in flight, backing off, or excluded.
    pub fn peek_batch_excluding(
        &self,
        max_size: usize,
        excluded: &HashSet<OperationId>,
    ) -> Result<Vec<ChangeOperation>> {
        self.store
            .with_connection(|conn| Self::select_batch_in(conn, max_size, excluded))
    }

    /// [`ChangeQueue::peek_batch_excluding`] inside a caller's transaction
    pub(crate) fn select_batch_in(
        conn: &Connection,
        max_size: usize,
        excluded: &HashSet<OperationId>,
    ) -> Result<Vec<ChangeOperation>> {
        if max_size == 0 {
            return Ok(Vec::new());
        }
        let active = SqliteOperationRepository::new(conn).list_active()?;
        let now = now_millis();

        let mut blocked = HashSet::new();
        let mut ready = Vec::new();
        for op in active {
            let key = op.key();
            if blocked.contains(&key) {
                continue;
            }
            blocked.insert(key);
            if op.is_due(now) && !excluded.contains(&op.op_id) {
                ready.push(op);
            }
        }

        ready.sort_by_key(|op| (op.priority, op.sequence));
        ready.truncate(max_size);
        Ok(ready)
    }

    pub fn mark_in_flight(&self, op_ids: &[OperationId]) -> Result<usize> {
        self.store
            .with_connection(|conn| Self::mark_in_flight_in(conn, op_ids))
    }

    pub(crate) fn mark_in_flight_in(conn: &Connection, op_ids: &[OperationId]) -> Result<usize> {
        SqliteOperationRepository::new(conn).set_status(op_ids, OperationStatus::InFlight)
    }

    /// Return operations to the queue without counting an attempt
    pub fn release(&self, op_ids: &[OperationId]) -> Result<usize> {
        self.store
            .with_connection(|conn| Self::release_in(conn, op_ids))
    }

    pub(crate) fn release_in(conn: &Connection, op_ids: &[OperationId]) -> Result<usize> {
        SqliteOperationRepository::new(conn).set_status(op_ids, OperationStatus::Queued)
    }

    /// Remove an operation the remote accepted; returns whether it was still queued
    pub fn ack(&self, op_id: &OperationId) -> Result<bool> {
        self.store.dequeue_operation(op_id)
    }

    pub(crate) fn ack_in(conn: &Connection, op_id: &OperationId) -> Result<bool> {
        SqliteOperationRepository::new(conn).delete(op_id)
    }

    /// Record a failed attempt and schedule the next one, or give up
    pub fn fail(&self, op_id: &OperationId, error: &str) -> Result<FailOutcome> {
        self.store
            .transaction(|conn| self.fail_in(conn, op_id, error))
    }

    /// [`ChangeQueue::fail`] inside a caller's transaction
    pub(crate) fn fail_in(
        &self,
        conn: &Connection,
        op_id: &OperationId,
        error: &str,
    ) -> Result<FailOutcome> {
        let repo = SqliteOperationRepository::new(conn);
        let Some(mut op) = repo.get(op_id)? else {
            return Ok(FailOutcome::Gone);
        };
        if op.status == OperationStatus::Failed {
            return Ok(FailOutcome::Exhausted(op));
        }

        op.retry_count = op.retry_count.saturating_add(1);
        op.last_error = Some(compact_text(error));

        if op.retry_count >= op.max_retries {
            op.status = OperationStatus::Failed;
            repo.update(&op)?;
            tracing::warn!(
                op_id = %op.op_id,
                entity = %op.key(),
                retries = op.retry_count,
                error = %error,
                "Change operation exhausted its retries"
            );
            return Ok(FailOutcome::Exhausted(op));
        }

        let delay = self.config.backoff(op.retry_count);
        op.status = OperationStatus::Queued;
        op.next_attempt_at =
            now_millis().saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX));
        repo.update(&op)?;
        tracing::info!(
            op_id = %op.op_id,
            retry = op.retry_count,
            delay_ms = delay.as_millis(),
            error = %error,
            "Change operation will be retried"
        );
        Ok(FailOutcome::Retrying {
            retry_count: op.retry_count,
            next_attempt_at: op.next_attempt_at,
        })
    }

    /// Exhausted operations kept for inspection, newest first
    pub fn failed_operations(&self, limit: Option<usize>) -> Result<Vec<ChangeOperation>> {
        self.store
            .with_connection(|conn| SqliteOperationRepository::new(conn).list_failed(limit))
    }

    /// Put an exhausted operation back in the queue with a fresh retry budget
    pub fn retry_failed(&self, op_id: &OperationId) -> Result<ChangeOperation> {
        self.store.transaction(|conn| {
            let repo = SqliteOperationRepository::new(conn);
            let mut op = repo
                .get(op_id)?
                .ok_or_else(|| Error::NotFound(format!("operation {op_id}")))?;
            if op.status != OperationStatus::Failed {
                return Err(Error::InvalidInput(format!(
                    "operation {op_id} has not failed"
                )));
            }
            op.retry_count = 0;
            op.status = OperationStatus::Queued;
            op.next_attempt_at = now_millis();
            repo.update(&op)?;
            Ok(op)
        })
    }

    /// Drop queued and in-flight operations of one entity
    pub fn discard_for_entity(&self, key: &EntityKey) -> Result<usize> {
        self.store
            .with_connection(|conn| Self::discard_in(conn, key))
    }

    pub(crate) fn discard_in(conn: &Connection, key: &EntityKey) -> Result<usize> {
        SqliteOperationRepository::new(conn).delete_active_for_entity(key)
    }

    pub fn has_pending_for(&self, key: &EntityKey) -> Result<bool> {
        self.store
            .with_connection(|conn| Self::has_pending_in(conn, key))
    }

    pub(crate) fn has_pending_in(conn: &Connection, key: &EntityKey) -> Result<bool> {
        Ok(!SqliteOperationRepository::new(conn)
            .list_active_for_entity(key)?
            .is_empty())
    }

    /// Point the entity's remaining operations at the version the remote just
    /// accepted, since they were made on top of the acknowledged change.
    /// Returns how many operations are still active.
    pub(crate) fn rebase_in(
        conn: &Connection,
        key: &EntityKey,
        server_version: Option<i64>,
    ) -> Result<usize> {
        let repo = SqliteOperationRepository::new(conn);
        let remaining = repo.list_active_for_entity(key)?;
        if let Some(version) = server_version {
            for mut op in remaining.iter().cloned() {
                if op.base_version != Some(version) {
                    op.base_version = Some(version);
                    repo.update(&op)?;
                }
            }
        }
        Ok(remaining.len())
    }

    /// Queued plus in-flight operations
    pub fn pending_count(&self) -> Result<usize> {
        self.store.with_connection(|conn| {
            let repo = SqliteOperationRepository::new(conn);
            Ok(repo.count_by_status(OperationStatus::Queued)?
                + repo.count_by_status(OperationStatus::InFlight)?)
        })
    }

    pub fn failed_count(&self) -> Result<usize> {
        self.store.with_connection(|conn| {
            SqliteOperationRepository::new(conn).count_by_status(OperationStatus::Failed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn queue() -> ChangeQueue {
        ChangeQueue::new(LocalStore::open_in_memory().unwrap(), QueueConfig::default())
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().unwrap().clone()
    }

    fn id(value: &str) -> EntityId {
        value.parse().unwrap()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = QueueConfig {
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_millis(1_000),
            ..QueueConfig::default()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(400));
        assert_eq!(config.backoff(10), Duration::from_millis(1_000));
        assert_eq!(config.backoff(200), Duration::from_millis(1_000));
    }

    #[test]
    fn priority_orders_deletes_and_money_first() {
        let mut config = QueueConfig::default();
        assert_eq!(
            config.priority_for(OperationKind::Delete, EntityType::Bay),
            DELETE_PRIORITY
        );
        assert_eq!(config.priority_for(OperationKind::Update, EntityType::Payment), 1);
        assert_eq!(config.priority_for(OperationKind::Create, EntityType::Bay), 4);

        config.priorities.insert(EntityType::Bay, 0);
        assert_eq!(config.priority_for(OperationKind::Create, EntityType::Bay), 0);
    }

    #[test]
    fn update_coalesces_into_unattempted_create() {
        let queue = queue();
        let created = queue
            .enqueue(
                OperationKind::Create,
                EntityType::Customer,
                &id("C1"),
                payload(json!({"name": "Acme", "phone": "1"})),
                None,
            )
            .unwrap();
        let updated = queue
            .enqueue(
                OperationKind::Update,
                EntityType::Customer,
                &id("C1"),
                payload(json!({"phone": "2"})),
                None,
            )
            .unwrap();

        assert_eq!(updated, created);
        let batch = queue.peek_batch(10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].kind, OperationKind::Create);
        assert_eq!(
            batch[0].payload_delta,
            payload(json!({"name": "Acme", "phone": "2"}))
        );
    }

    #[test]
    fn update_after_attempt_is_queued_separately() {
        let queue = queue();
        let first = queue
            .enqueue(
                OperationKind::Update,
                EntityType::Customer,
                &id("C1"),
                payload(json!({"a": 1})),
                Some(1),
            )
            .unwrap();
        queue.mark_in_flight(std::slice::from_ref(&first)).unwrap();

        let second = queue
            .enqueue(
                OperationKind::Update,
                EntityType::Customer,
                &id("C1"),
                payload(json!({"a": 2})),
                Some(1),
            )
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(queue.pending_count().unwrap(), 2);
        // The in-flight head blocks the entity.
        assert!(queue.peek_batch(10).unwrap().is_empty());
    }

    #[test]
    fn delete_supersedes_queued_operations() {
        let queue = queue();
        let first = queue
            .enqueue(OperationKind::Update, EntityType::Vehicle, &id("V1"), payload(json!({"vin": "X"})), Some(3))
            .unwrap();
        queue.mark_in_flight(std::slice::from_ref(&first)).unwrap();
        queue
            .enqueue(OperationKind::Update, EntityType::Vehicle, &id("V1"), payload(json!({"km": 10})), Some(3))
            .unwrap();
        queue.release(std::slice::from_ref(&first)).unwrap();
        queue
            .enqueue(OperationKind::Delete, EntityType::Vehicle, &id("V1"), Payload::new(), Some(3))
            .unwrap();

        let batch = queue.peek_batch(10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].kind, OperationKind::Delete);
        assert_eq!(batch[0].priority, DELETE_PRIORITY);
        assert_eq!(queue.pending_count().unwrap(), 1);
    }

    #[test]
    fn delete_of_unsent_create_leaves_nothing_to_send() {
        let queue = queue();
        let create = queue
            .enqueue(OperationKind::Create, EntityType::Customer, &id("C9"), payload(json!({"name": "Caio"})), None)
            .unwrap();
        queue
            .enqueue(OperationKind::Update, EntityType::Customer, &id("C9"), payload(json!({"phone": "1"})), None)
            .unwrap();

        let returned = queue
            .enqueue(OperationKind::Delete, EntityType::Customer, &id("C9"), Payload::new(), None)
            .unwrap();

        assert_eq!(returned, create);
        assert_eq!(queue.pending_count().unwrap(), 0);
        assert!(queue.peek_batch(10).unwrap().is_empty());
    }

    #[test]
    fn delete_after_attempted_create_is_still_sent() {
        let queue = queue();
        let create = queue
            .enqueue(OperationKind::Create, EntityType::Customer, &id("C9"), Payload::new(), None)
            .unwrap();
        // The remote may already hold the entity once a create has been sent.
        queue.mark_in_flight(std::slice::from_ref(&create)).unwrap();

        let delete = queue
            .enqueue(OperationKind::Delete, EntityType::Customer, &id("C9"), Payload::new(), None)
            .unwrap();

        assert_ne!(delete, create);
        let batch = queue.peek_batch(10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].op_id, delete);
        assert_eq!(batch[0].kind, OperationKind::Delete);
    }

    #[test]
    fn peek_batch_orders_by_priority_then_sequence() {
        let queue = queue();
        queue
            .enqueue(OperationKind::Create, EntityType::Bay, &id("B1"), Payload::new(), None)
            .unwrap();
        queue
            .enqueue(OperationKind::Create, EntityType::Customer, &id("C1"), Payload::new(), None)
            .unwrap();
        queue
            .enqueue(OperationKind::Create, EntityType::Payment, &id("P1"), Payload::new(), None)
            .unwrap();
        queue
            .enqueue(OperationKind::Create, EntityType::Customer, &id("C2"), Payload::new(), None)
            .unwrap();

        let order: Vec<_> = queue
            .peek_batch(10)
            .unwrap()
            .into_iter()
            .map(|op| op.entity_id.to_string())
            .collect();
        assert_eq!(order, vec!["P1", "C1", "C2", "B1"]);
        assert_eq!(queue.peek_batch(2).unwrap().len(), 2);
    }

    #[test]
    fn one_operation_per_entity_in_enqueue_order() {
        let queue = queue();
        let create = queue
            .enqueue(OperationKind::Create, EntityType::Customer, &id("C1"), Payload::new(), None)
            .unwrap();
        queue.mark_in_flight(std::slice::from_ref(&create)).unwrap();
        queue.release(std::slice::from_ref(&create)).unwrap();
        let update = queue
            .enqueue(
                OperationKind::Update,
                EntityType::Customer,
                &id("C1"),
                payload(json!({"a": 1})),
                None,
            )
            .unwrap();

        let batch = queue.peek_batch(10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].op_id, create);

        assert!(queue.ack(&create).unwrap());
        let batch = queue.peek_batch(10).unwrap();
        assert_eq!(batch[0].op_id, update);
    }

    #[test]
    fn fail_backs_off_then_exhausts() {
        let queue = ChangeQueue::new(
            LocalStore::open_in_memory().unwrap(),
            QueueConfig {
                backoff_base: Duration::from_secs(60),
                ..QueueConfig::default()
            },
        );
        let op_id = queue
            .enqueue(OperationKind::Create, EntityType::Invoice, &id("I1"), Payload::new(), None)
            .unwrap();

        let outcome = queue.fail(&op_id, "HTTP 500").unwrap();
        assert!(matches!(outcome, FailOutcome::Retrying { retry_count: 1, .. }));
        assert!(queue.peek_batch(10).unwrap().is_empty());

        assert!(matches!(
            queue.fail(&op_id, "HTTP 500").unwrap(),
            FailOutcome::Retrying { retry_count: 2, .. }
        ));
        let FailOutcome::Exhausted(op) = queue.fail(&op_id, "HTTP 500").unwrap() else {
            panic!("expected exhaustion after max retries");
        };
        assert_eq!(op.retry_count, 3);
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.last_error.as_deref(), Some("HTTP 500"));

        assert_eq!(queue.pending_count().unwrap(), 0);
        assert_eq!(queue.failed_count().unwrap(), 1);
        assert_eq!(queue.failed_operations(None).unwrap()[0].op_id, op_id);
    }

    #[test]
    fn failed_operation_does_not_block_later_ones() {
        let queue = ChangeQueue::new(
            LocalStore::open_in_memory().unwrap(),
            QueueConfig {
                max_retries: 1,
                ..QueueConfig::default()
            },
        );
        let first = queue
            .enqueue(OperationKind::Create, EntityType::Customer, &id("C1"), Payload::new(), None)
            .unwrap();
        queue.mark_in_flight(std::slice::from_ref(&first)).unwrap();
        let second = queue
            .enqueue(
                OperationKind::Update,
                EntityType::Customer,
                &id("C1"),
                payload(json!({"a": 1})),
                None,
            )
            .unwrap();

        assert!(matches!(
            queue.fail(&first, "rejected").unwrap(),
            FailOutcome::Exhausted(_)
        ));
        let batch = queue.peek_batch(10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].op_id, second);
    }

    #[test]
    fn retry_failed_requeues_with_fresh_budget() {
        let queue = ChangeQueue::new(
            LocalStore::open_in_memory().unwrap(),
            QueueConfig {
                max_retries: 1,
                ..QueueConfig::default()
            },
        );
        let op_id = queue
            .enqueue(OperationKind::Create, EntityType::Bay, &id("B1"), Payload::new(), None)
            .unwrap();
        assert!(queue.retry_failed(&op_id).is_err());

        queue.fail(&op_id, "rejected").unwrap();
        let op = queue.retry_failed(&op_id).unwrap();
        assert_eq!(op.retry_count, 0);
        assert_eq!(op.status, OperationStatus::Queued);
        assert_eq!(queue.peek_batch(1).unwrap()[0].op_id, op_id);
        assert!(matches!(
            queue.retry_failed(&OperationId::new()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn fail_on_superseded_operation_is_gone() {
        let queue = queue();
        let create = queue
            .enqueue(OperationKind::Create, EntityType::Customer, &id("C1"), Payload::new(), None)
            .unwrap();
        queue
            .enqueue(OperationKind::Delete, EntityType::Customer, &id("C1"), Payload::new(), None)
            .unwrap();

        assert_eq!(queue.fail(&create, "late").unwrap(), FailOutcome::Gone);
        assert!(!queue.ack(&create).unwrap());
    }

    #[test]
    fn excluded_operations_block_their_entity() {
        let queue = queue();
        let first = queue
            .enqueue(OperationKind::Create, EntityType::Customer, &id("C1"), Payload::new(), None)
            .unwrap();
        let other = queue
            .enqueue(OperationKind::Create, EntityType::Customer, &id("C2"), Payload::new(), None)
            .unwrap();

        let excluded = HashSet::from([first]);
        let batch = queue.peek_batch_excluding(10, &excluded).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].op_id, other);
    }

    #[test]
    fn ack_rebases_the_operations_left_behind() {
        let queue = queue();
        let key = EntityKey::new(EntityType::Invoice, id("I1"));
        let first = queue
            .enqueue(OperationKind::Update, key.entity_type, &key.id, payload(json!({"total": 11})), Some(1))
            .unwrap();
        queue.mark_in_flight(std::slice::from_ref(&first)).unwrap();
        let second = queue
            .enqueue(OperationKind::Update, key.entity_type, &key.id, payload(json!({"total": 12})), Some(1))
            .unwrap();

        let remaining = queue
            .store
            .transaction(|conn| {
                assert!(ChangeQueue::ack_in(conn, &first)?);
                ChangeQueue::rebase_in(conn, &key, Some(2))
            })
            .unwrap();

        assert_eq!(remaining, 1);
        let batch = queue.peek_batch(10).unwrap();
        assert_eq!(batch[0].op_id, second);
        assert_eq!(batch[0].base_version, Some(2));
    }

    #[test]
    fn replace_leaves_single_full_update() {
        let queue = queue();
        let key = EntityKey::new(EntityType::ServiceOrder, id("SO1"));
        queue
            .enqueue(OperationKind::Create, key.entity_type, &key.id, payload(json!({"a": 1})), None)
            .unwrap();
        let replacement = queue
            .store
            .transaction(|conn| queue.replace_in(conn, &key, payload(json!({"a": 2, "b": 3})), Some(7)))
            .unwrap();

        let batch = queue.peek_batch(10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].op_id, replacement);
        assert_eq!(batch[0].kind, OperationKind::Update);
        assert_eq!(batch[0].base_version, Some(7));
        assert!(queue.has_pending_for(&key).unwrap());
        assert_eq!(queue.discard_for_entity(&key).unwrap(), 1);
        assert!(!queue.has_pending_for(&key).unwrap());
    }
}
