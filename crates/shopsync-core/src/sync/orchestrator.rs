//! Online/offline state machine that reconciles the local store with the remote.
//!
//! A pass pulls remote deltas per entity type, settles conflicts, then drains
//! the change queue. Only one pass runs at a time; a trigger while a pass is
//! running returns [`SyncOutcome::AlreadyRunning`].

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use rusqlite::Connection;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;

use super::remote::{PullRequest, PushRequest, PushResult, RemoteError, RemoteRecord, RemoteSync};
use crate::cache::{CacheEvent, EntityCache};
use crate::db::{EntityRepository, SqliteConflictRepository, SqliteEntityRepository};
use crate::models::{
    ChangeOperation, ConflictId, ConflictRecord, Entity, EntityKey, EntityType, ManualChoice,
    OperationId, OperationKind, Origin, Payload, ResolutionStrategy, SyncState,
};
use crate::queue::{ChangeQueue, FailOutcome};
use crate::resolver::{ConflictResolver, Resolution, Winner};
use crate::state::OrchestratorState;
use crate::store::LocalStore;
use crate::util::now_millis;
use crate::{Error, Result};

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Time between passes while online
    pub sync_interval: Duration,
    /// Upper bound for a single pull or push call
    pub request_timeout: Duration,
    /// Operations per push request
    pub batch_size: usize,
    /// Entity types pulled each pass, in order
    pub tracked_types: Vec<EntityType>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            request_timeout: super::http::DEFAULT_REQUEST_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
            tracked_types: EntityType::ALL.to_vec(),
        }
    }
}

/// Counters of one sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub pulled: usize,
    pub applied: usize,
    pub removed: usize,
    pub conflicts_detected: usize,
    pub conflicts_resolved: usize,
    pub pushed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Types whose pull failed permanently this pass
    pub skipped_types: Vec<EntityType>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another pass holds the lock
    AlreadyRunning,
    Offline,
    /// A transient remote failure stopped the pass; nothing was committed
    /// beyond what `report` counts
    Aborted { report: SyncReport, reason: String },
}

enum PulledRecord {
    Applied,
    Skipped,
    Conflict(ConflictRecord),
}

/// Drives sync passes against `R`
pub struct SyncOrchestrator<R> {
    remote: R,
    store: LocalStore,
    cache: EntityCache,
    queue: ChangeQueue,
    resolver: ConflictResolver,
    config: OrchestratorConfig,
    online: AtomicBool,
    state: watch::Sender<OrchestratorState>,
    pass_lock: Mutex<()>,
}

impl<R: RemoteSync> SyncOrchestrator<R> {
    pub fn new(
        remote: R,
        store: LocalStore,
        cache: EntityCache,
        queue: ChangeQueue,
        resolver: ConflictResolver,
        config: OrchestratorConfig,
    ) -> Self {
        let (state, _) = watch::channel(OrchestratorState::Offline);
        Self {
            remote,
            store,
            cache,
            queue,
            resolver,
            config,
            online: AtomicBool::new(false),
            state,
            pass_lock: Mutex::new(()),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<OrchestratorState> {
        self.state.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub const fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    /// Record a connectivity change. A running pass keeps `Syncing` until it ends.
    pub fn set_online(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        self.state.send_modify(|state| {
            *state = match (*state, online) {
                (OrchestratorState::Syncing, _) => OrchestratorState::Syncing,
                (_, true) => OrchestratorState::Idle,
                (_, false) => OrchestratorState::Offline,
            };
        });
        if was_online != online {
            tracing::info!(online, "Connectivity changed");
        }
    }

    /// Run one sync pass now
    pub async fn sync_now(&self) -> Result<SyncOutcome> {
        if !self.is_online() {
            return Ok(SyncOutcome::Offline);
        }
        let Ok(_guard) = self.pass_lock.try_lock() else {
            tracing::debug!("Sync pass already running");
            return Ok(SyncOutcome::AlreadyRunning);
        };

        self.state.send_replace(OrchestratorState::Syncing);
        let started = now_millis();
        let mut report = SyncReport::default();
        let result = self.run_pass(&mut report).await;

        if result.is_err() {
            if let Err(error) = self.recover_interrupted() {
                tracing::error!(%error, "Failed to release in-flight operations");
            }
        }
        self.state.send_replace(if self.is_online() {
            OrchestratorState::Idle
        } else {
            OrchestratorState::Offline
        });

        match result {
            Ok(()) => {
                tracing::info!(
                    pulled = report.pulled,
                    pushed = report.pushed,
                    conflicts = report.conflicts_detected,
                    failed = report.failed,
                    elapsed_ms = now_millis() - started,
                    "Sync pass completed"
                );
                Ok(SyncOutcome::Completed(report))
            }
            Err(error) if error.is_transient() => {
                tracing::warn!(%error, "Sync pass aborted; will retry on next trigger");
                Ok(SyncOutcome::Aborted {
                    report,
                    reason: error.to_string(),
                })
            }
            Err(error) => {
                tracing::error!(%error, "Sync pass failed");
                Err(error)
            }
        }
    }

    /// Follow `connectivity` until its sender is dropped.
    ///
    /// Going online triggers an immediate pass; while online a pass runs
    /// every `sync_interval`.
    pub async fn run(&self, mut connectivity: watch::Receiver<bool>) {
        let online = *connectivity.borrow_and_update();
        self.set_online(online);
        if online {
            self.sync_logged().await;
        }

        let mut ticker = tokio::time::interval(self.config.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        tracing::debug!("Connectivity signal closed; stopping sync loop");
                        break;
                    }
                    let online = *connectivity.borrow_and_update();
                    let was_online = self.is_online();
                    self.set_online(online);
                    if online && !was_online {
                        self.sync_logged().await;
                        ticker.reset();
                    }
                }
                _ = ticker.tick() => {
                    if self.is_online() {
                        self.sync_logged().await;
                    }
                }
            }
        }
    }

    async fn sync_logged(&self) {
        if let Err(error) = self.sync_now().await {
            tracing::error!(%error, "Scheduled sync pass failed");
        }
    }

    /// Return operations left in flight to the queue and their entities to `pending`
    pub fn recover_interrupted(&self) -> Result<usize> {
        let released = self.store.recover_in_flight()?;
        for entity in self.store.query_pending(None)? {
            if entity.sync_state == SyncState::Syncing {
                self.update_sync_state(&entity.key(), SyncState::Pending, None)?;
            }
        }
        Ok(released)
    }

    async fn call<T>(
        &self,
        request: impl Future<Output = std::result::Result<T, RemoteError>>,
    ) -> std::result::Result<T, RemoteError> {
        tokio::time::timeout(self.config.request_timeout, request)
            .await
            .unwrap_or(Err(RemoteError::Timeout))
    }

    async fn run_pass(&self, report: &mut SyncReport) -> Result<()> {
        let cursors = self.pull_phase(report).await?;
        self.conflict_phase(report)?;
        self.push_phase(report).await?;
        // Conflicts reported by the push phase
        self.conflict_phase(report)?;
        self.store.record_sync_completed(&cursors, now_millis())
    }

    // -----------------------------------------------------------------------
    // Pull
    // -----------------------------------------------------------------------

    async fn pull_phase(&self, report: &mut SyncReport) -> Result<Vec<(EntityType, i64)>> {
        let mut cursors = Vec::with_capacity(self.config.tracked_types.len());

        for &entity_type in &self.config.tracked_types {
            let since = self.store.pull_cursor(entity_type)?;
            let response = match self
                .call(self.remote.pull(PullRequest { entity_type, since }))
                .await
            {
                Ok(response) => response,
                Err(error) if error.is_transient() => return Err(error.into()),
                Err(error) => {
                    tracing::warn!(%entity_type, %error, "Skipping entity type after pull failure");
                    report.skipped_types.push(entity_type);
                    continue;
                }
            };

            let observed_at = now_millis();
            for record in response.records {
                report.pulled += 1;
                self.apply_pulled(entity_type, record, observed_at, report)?;
            }
            cursors.push((entity_type, response.server_timestamp));
        }

        Ok(cursors)
    }

    fn apply_pulled(
        &self,
        entity_type: EntityType,
        record: RemoteRecord,
        observed_at: i64,
        report: &mut SyncReport,
    ) -> Result<()> {
        let key = EntityKey::new(entity_type, record.id.clone());
        if record.deleted {
            if self.remove_entity(&key)? {
                report.removed += 1;
            }
            return Ok(());
        }

        let remote = record.into_entity(entity_type, observed_at);
        let strategy = self.resolver.strategy_for(entity_type);
        // The local row is read and replaced under one lock; a concurrent local
        // write either happens first and is seen here, or lands afterwards.
        let outcome = self.store.commit_with_cache(&self.cache, |conn| {
            let entities = SqliteEntityRepository::new(conn);
            let accept = match entities.get(entity_type, &key.id)? {
                // A queued local delete is still on its way.
                None => !ChangeQueue::has_pending_in(conn, &key)?,
                Some(local) if !local.has_unsynced_changes() => local
                    .remote_version
                    .is_none_or(|known| remote.version > known),
                Some(local) => {
                    if local.remote_version == Some(remote.version) {
                        return Ok((PulledRecord::Skipped, Vec::new()));
                    }
                    let record = Self::record_conflict_in(conn, local, remote, strategy, None)?;
                    return Ok((PulledRecord::Conflict(record), Vec::new()));
                }
            };
            if !accept {
                return Ok((PulledRecord::Skipped, Vec::new()));
            }
            let stored = entities.put(&remote)?;
            Ok((PulledRecord::Applied, vec![CacheEvent::Upserted(stored)]))
        })?;

        match outcome {
            PulledRecord::Applied => report.applied += 1,
            PulledRecord::Conflict(record) => {
                Self::log_conflict(&record);
                report.conflicts_detected += 1;
            }
            PulledRecord::Skipped => {}
        }
        Ok(())
    }

    /// Drop an entity deleted remotely, with its queued operations and open conflict
    fn remove_entity(&self, key: &EntityKey) -> Result<bool> {
        let removed = self.store.commit_with_cache(&self.cache, |conn| {
            let discarded = ChangeQueue::discard_in(conn, key)?;
            let conflicts = SqliteConflictRepository::new(conn);
            if let Some(record) = conflicts.get_for_entity(key)? {
                conflicts.delete(&record.id)?;
            }
            let removed = SqliteEntityRepository::new(conn).delete(key.entity_type, &key.id)?;
            Ok((removed || discarded > 0, vec![CacheEvent::Removed(key.clone())]))
        })?;
        if removed {
            tracing::info!(entity = %key, "Applied remote deletion");
        }
        Ok(removed)
    }

    fn record_conflict_in(
        conn: &Connection,
        local: Entity,
        remote: Entity,
        strategy: ResolutionStrategy,
        op_id: Option<OperationId>,
    ) -> Result<ConflictRecord> {
        let mut record = ConflictRecord::new(local, remote, strategy);
        if let Some(op_id) = op_id {
            record = record.with_operation(op_id);
        }
        SqliteConflictRepository::new(conn).upsert(&record)
    }

    fn log_conflict(record: &ConflictRecord) {
        tracing::info!(
            conflict_id = %record.id,
            entity = %record.key(),
            local_version = record.local_version.version,
            remote_version = record.remote_version.version,
            strategy = %record.resolution_strategy,
            "Conflict detected"
        );
    }

    // -----------------------------------------------------------------------
    // Conflicts
    // -----------------------------------------------------------------------

    fn conflict_phase(&self, report: &mut SyncReport) -> Result<()> {
        for record in self.store.list_conflicts(None)? {
            let settled = self.settle(&record, |local| {
                Ok(self.resolver.resolve_with(
                    record.resolution_strategy,
                    local,
                    &record.remote_version,
                ))
            })?;
            if settled.is_some() {
                report.conflicts_resolved += 1;
            }
        }
        Ok(())
    }

    /// Apply a decision for an external actor's manual choice
    pub fn resolve_manually(
        &self,
        conflict_id: &ConflictId,
        choice: ManualChoice,
        custom_payload: Option<Payload>,
    ) -> Result<Entity> {
        let not_found = || Error::NotFound(format!("conflict {conflict_id}"));
        let record = self.store.get_conflict(conflict_id)?.ok_or_else(not_found)?;
        let remote = &record.remote_version;
        let entity_type = record.entity_type;

        let settled = self.settle(&record, |local| {
            let (winner, payload) = match choice {
                ManualChoice::Local => (Winner::Local, local.payload.clone()),
                ManualChoice::Remote => (Winner::Remote, remote.payload.clone()),
                ManualChoice::Merge => (
                    Winner::Merged,
                    self.resolver
                        .merge(entity_type, &local.payload, &remote.payload),
                ),
                ManualChoice::Custom => (
                    Winner::Merged,
                    custom_payload.ok_or_else(|| {
                        Error::InvalidInput("custom resolution requires a payload".to_string())
                    })?,
                ),
            };
            Ok(Resolution::Resolved { winner, payload })
        })?;
        settled.ok_or_else(not_found)
    }

    /// Decide a conflict against the current local row and write the outcome.
    ///
    /// `decide` runs inside the transaction, so local writes made since the
    /// conflict was recorded are part of the decision. A remote winner is
    /// stored as synced with no pending operations. A local or merged winner
    /// is stored as pending and pushed as one full update based on the remote
    /// version. Returns `None` when the decision is deferred or the conflict
    /// was closed in the meantime.
    fn settle(
        &self,
        record: &ConflictRecord,
        decide: impl FnOnce(&Entity) -> Result<Resolution>,
    ) -> Result<Option<Entity>> {
        let key = record.key();
        let remote = &record.remote_version;

        let settled = self.store.commit_with_cache(&self.cache, |conn| {
            let conflicts = SqliteConflictRepository::new(conn);
            if conflicts.get(&record.id)?.is_none() {
                return Ok((None, Vec::new()));
            }
            let entities = SqliteEntityRepository::new(conn);
            let local = entities
                .get(key.entity_type, &key.id)?
                .unwrap_or_else(|| record.local_version.clone());

            let (winner, payload) = match decide(&local)? {
                Resolution::Deferred => {
                    let events = if local.sync_state == SyncState::Conflict {
                        Vec::new()
                    } else {
                        Self::sync_state_in(conn, &key, SyncState::Conflict, None)?
                    };
                    return Ok((None, events));
                }
                Resolution::Resolved { winner, payload } => (winner, payload),
            };

            let stored = match winner {
                Winner::Remote => {
                    ChangeQueue::discard_in(conn, &key)?;
                    entities.put(&Entity {
                        payload,
                        ..remote.clone()
                    })?
                }
                Winner::Local | Winner::Merged => {
                    let stored = entities.put(&Entity {
                        entity_type: key.entity_type,
                        id: key.id.clone(),
                        payload: payload.clone(),
                        version: local.version.max(remote.version) + 1,
                        remote_version: Some(remote.version),
                        sync_state: SyncState::Pending,
                        last_modified_at: now_millis(),
                        origin: Origin::Local,
                    })?;
                    self.queue
                        .replace_in(conn, &key, payload, Some(remote.version))?;
                    stored
                }
            };

            conflicts.delete(&record.id)?;
            Ok((Some((winner, stored.clone())), vec![CacheEvent::Upserted(stored)]))
        })?;

        Ok(settled.map(|(winner, entity)| {
            tracing::info!(
                conflict_id = %record.id,
                entity = %key,
                winner = ?winner,
                version = entity.version,
                "Conflict resolved"
            );
            entity
        }))
    }

    // -----------------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------------

    async fn push_phase(&self, report: &mut SyncReport) -> Result<()> {
        let batch_size = self.config.batch_size.max(1);
        let mut attempted = HashSet::new();

        loop {
            // Selection and the in-flight mark share one transaction, so a local
            // update cannot fold into an operation after it was read for this batch.
            let (selected, batch) = self.store.commit_with_cache(&self.cache, |conn| {
                let selected = ChangeQueue::select_batch_in(conn, batch_size, &attempted)?;
                attempted.extend(selected.iter().map(|op| op.op_id.clone()));
                let count = selected.len();

                // Entities waiting on a conflict decision hold their operations.
                let conflicts = SqliteConflictRepository::new(conn);
                let mut batch = Vec::with_capacity(count);
                for op in selected {
                    if conflicts.get_for_entity(&op.key())?.is_none() {
                        batch.push(op);
                    }
                }

                let op_ids: Vec<OperationId> = batch.iter().map(|op| op.op_id.clone()).collect();
                ChangeQueue::mark_in_flight_in(conn, &op_ids)?;
                let mut events = Vec::new();
                for op in batch.iter().filter(|op| op.kind != OperationKind::Delete) {
                    events.extend(Self::sync_state_in(conn, &op.key(), SyncState::Syncing, None)?);
                }
                Ok(((count, batch), events))
            })?;
            if selected == 0 {
                return Ok(());
            }
            if batch.is_empty() {
                continue;
            }

            let response = match self
                .call(self.remote.push(PushRequest::from_operations(&batch)))
                .await
            {
                Ok(response) => response,
                Err(error) if error.is_transient() => {
                    self.release_batch(&batch)?;
                    return Err(error.into());
                }
                Err(error) => {
                    let message = error.to_string();
                    for op in &batch {
                        self.handle_rejection(op, &message, report)?;
                    }
                    continue;
                }
            };

            let mut results: HashMap<OperationId, PushResult> = response
                .results
                .into_iter()
                .map(|result| (result.op_id.clone(), result))
                .collect();

            for op in &batch {
                match results.remove(&op.op_id) {
                    Some(result) if result.success => {
                        self.handle_ack(op, result.server_version, report)?;
                    }
                    Some(result) if result.conflict => {
                        self.handle_push_conflict(op, result, report)?;
                    }
                    Some(result) => {
                        let message = result
                            .error
                            .unwrap_or_else(|| "rejected by remote".to_string());
                        self.handle_rejection(op, &message, report)?;
                    }
                    None => {
                        self.handle_rejection(op, "missing from push response", report)?;
                    }
                }
            }
        }
    }

    fn handle_ack(
        &self,
        op: &ChangeOperation,
        server_version: Option<i64>,
        report: &mut SyncReport,
    ) -> Result<()> {
        let key = op.key();
        let acked = self.store.commit_with_cache(&self.cache, |conn| {
            // Already superseded locally (deleted or replaced by a resolution).
            if !ChangeQueue::ack_in(conn, &op.op_id)? {
                return Ok((false, Vec::new()));
            }
            if op.kind == OperationKind::Delete {
                return Ok((true, Vec::new()));
            }
            let state = if ChangeQueue::rebase_in(conn, &key, server_version)? > 0 {
                SyncState::Pending
            } else {
                SyncState::Synced
            };
            Ok((true, Self::sync_state_in(conn, &key, state, server_version)?))
        })?;
        if acked {
            report.pushed += 1;
        }
        Ok(())
    }

    fn handle_push_conflict(
        &self,
        op: &ChangeOperation,
        result: PushResult,
        report: &mut SyncReport,
    ) -> Result<()> {
        const NOT_COMPARABLE: &str = "conflict reported without a comparable record";

        let key = op.key();
        let Some(server_record) = result.server_record else {
            return self.handle_rejection(op, NOT_COMPARABLE, report);
        };
        let remote = server_record.into_entity(key.entity_type, now_millis());
        let strategy = self.resolver.strategy_for(key.entity_type);

        let recorded = self.store.commit_with_cache(&self.cache, |conn| {
            let Some(local) = SqliteEntityRepository::new(conn).set_sync_state(
                key.entity_type,
                &key.id,
                SyncState::Pending,
                None,
            )?
            else {
                return Ok((None, Vec::new()));
            };
            // The operation stays queued until the conflict is settled.
            ChangeQueue::release_in(conn, std::slice::from_ref(&op.op_id))?;
            let record = Self::record_conflict_in(
                conn,
                local.clone(),
                remote,
                strategy,
                Some(op.op_id.clone()),
            )?;
            Ok((Some(record), vec![CacheEvent::Upserted(local)]))
        })?;

        let Some(record) = recorded else {
            return self.handle_rejection(op, NOT_COMPARABLE, report);
        };
        Self::log_conflict(&record);
        report.conflicts_detected += 1;
        Ok(())
    }

    fn handle_rejection(
        &self,
        op: &ChangeOperation,
        error: &str,
        report: &mut SyncReport,
    ) -> Result<()> {
        let key = op.key();
        let outcome = self.store.commit_with_cache(&self.cache, |conn| {
            let outcome = self.queue.fail_in(conn, &op.op_id, error)?;
            if matches!(outcome, FailOutcome::Gone) || op.kind == OperationKind::Delete {
                return Ok((outcome, Vec::new()));
            }
            let state = if matches!(outcome, FailOutcome::Exhausted(_)) {
                SyncState::Failed
            } else {
                SyncState::Pending
            };
            let events = Self::sync_state_in(conn, &key, state, None)?;
            Ok((outcome, events))
        })?;

        match outcome {
            FailOutcome::Retrying { .. } => report.retried += 1,
            FailOutcome::Exhausted(_) => report.failed += 1,
            FailOutcome::Gone => {}
        }
        Ok(())
    }

    fn release_batch(&self, batch: &[ChangeOperation]) -> Result<()> {
        let op_ids: Vec<OperationId> = batch.iter().map(|op| op.op_id.clone()).collect();
        self.store.commit_with_cache(&self.cache, |conn| {
            ChangeQueue::release_in(conn, &op_ids)?;
            let mut events = Vec::new();
            for op in batch.iter().filter(|op| op.kind != OperationKind::Delete) {
                events.extend(Self::sync_state_in(conn, &op.key(), SyncState::Pending, None)?);
            }
            Ok(((), events))
        })
    }

    /// Persist a state change and mirror it into the cache
    fn update_sync_state(
        &self,
        key: &EntityKey,
        state: SyncState,
        remote_version: Option<i64>,
    ) -> Result<()> {
        self.store.commit_with_cache(&self.cache, |conn| {
            Ok(((), Self::sync_state_in(conn, key, state, remote_version)?))
        })
    }

    fn sync_state_in(
        conn: &Connection,
        key: &EntityKey,
        state: SyncState,
        remote_version: Option<i64>,
    ) -> Result<Vec<CacheEvent>> {
        let updated = SqliteEntityRepository::new(conn).set_sync_state(
            key.entity_type,
            &key.id,
            state,
            remote_version,
        )?;
        Ok(updated.into_iter().map(CacheEvent::Upserted).collect())
    }
}
