//! In-process remote for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::remote::{
    PullRequest, PullResponse, PushOperation, PushRequest, PushResponse, PushResult, RemoteError,
    RemoteRecord, RemoteResult, RemoteSync,
};
use crate::models::{EntityKey, EntityType, OperationKind};

#[derive(Default)]
struct FakeState {
    /// Record plus the server clock value of its last change
    records: HashMap<EntityType, BTreeMap<String, (RemoteRecord, i64)>>,
    clock: i64,
    online: bool,
    pushed: Vec<PushOperation>,
    pull_calls: usize,
    conflict_on: HashSet<EntityKey>,
    reject_on: HashMap<EntityKey, String>,
    failing_pulls: HashSet<EntityType>,
    delay: Option<Duration>,
    check_base_versions: bool,
}

/// Behaves like a well-formed sync service backed by in-memory maps
#[derive(Clone)]
pub struct FakeRemote {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeRemote {
    fn default() -> Self {
        let remote = Self {
            state: Arc::new(Mutex::new(FakeState::default())),
        };
        remote.set_online(true);
        remote
    }
}

impl FakeRemote {
    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_online(&self, online: bool) {
        self.state().online = online;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = Some(delay);
    }

    /// Store or replace a record as if another client had written it
    pub fn seed(&self, entity_type: EntityType, record: RemoteRecord) {
        let mut state = self.state();
        state.clock += 1;
        let clock = state.clock;
        state
            .records
            .entry(entity_type)
            .or_default()
            .insert(record.id.to_string(), (record, clock));
    }

    pub fn record(&self, key: &EntityKey) -> Option<RemoteRecord> {
        self.state()
            .records
            .get(&key.entity_type)
            .and_then(|records| records.get(key.id.as_str()))
            .map(|(record, _)| record.clone())
    }

    /// Report the next pushes for `key` as conflicting with the stored record
    pub fn conflict_on(&self, key: EntityKey) {
        self.state().conflict_on.insert(key);
    }

    /// Report updates and deletes whose base version is not the stored
    /// record's version as conflicting, like an optimistic-locking server
    pub fn check_base_versions(&self) {
        self.state().check_base_versions = true;
    }

    pub fn reject_on(&self, key: EntityKey, error: impl Into<String>) {
        self.state().reject_on.insert(key, error.into());
    }

    pub fn clear_rejection(&self, key: &EntityKey) {
        self.state().reject_on.remove(key);
    }

    pub fn fail_pulls_of(&self, entity_type: EntityType) {
        self.state().failing_pulls.insert(entity_type);
    }

    pub fn pushed(&self) -> Vec<PushOperation> {
        self.state().pushed.clone()
    }

    pub fn pull_calls(&self) -> usize {
        self.state().pull_calls
    }

    async fn pause(&self) {
        let delay = self.state().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn apply(state: &mut FakeState, op: &PushOperation) -> PushResult {
        let key = EntityKey::new(op.entity_type, op.entity_id.clone());
        if let Some(error) = state.reject_on.get(&key) {
            return PushResult::rejected(op.op_id.clone(), error.clone());
        }

        state.clock += 1;
        let clock = state.clock;
        let records = state.records.entry(op.entity_type).or_default();
        let existing = records.get(op.entity_id.as_str()).map(|(record, _)| record.clone());

        if let Some(existing) = &existing {
            let stale_base = state.check_base_versions
                && op.kind != OperationKind::Create
                && op.base_version != Some(existing.version);
            if stale_base || state.conflict_on.contains(&key) {
                return PushResult::conflicting(op.op_id.clone(), existing.clone());
            }
        }

        let version = existing.as_ref().map_or(0, |record| record.version) + 1;
        let mut payload = match (&op.kind, existing) {
            (OperationKind::Update, Some(existing)) => existing.payload,
            _ => serde_json::Map::new(),
        };
        payload.extend(op.payload.clone());

        let record = RemoteRecord {
            id: op.entity_id.clone(),
            payload,
            version,
            last_modified_at: Some(clock),
            deleted: op.kind == OperationKind::Delete,
        };
        records.insert(op.entity_id.to_string(), (record, clock));
        PushResult::accepted(op.op_id.clone(), version)
    }
}

impl RemoteSync for FakeRemote {
    async fn pull(&self, request: PullRequest) -> RemoteResult<PullResponse> {
        self.pause().await;
        let mut state = self.state();
        state.pull_calls += 1;
        if !state.online {
            return Err(RemoteError::Network("connection refused".to_string()));
        }
        if state.failing_pulls.contains(&request.entity_type) {
            return Err(RemoteError::Rejected(format!(
                "pull of {} not supported",
                request.entity_type
            )));
        }

        let since = request.since.unwrap_or(i64::MIN);
        let records = state
            .records
            .get(&request.entity_type)
            .map(|records| {
                records
                    .values()
                    .filter(|(_, changed_at)| *changed_at > since)
                    .map(|(record, _)| record.clone())
                    .collect()
            })
            .unwrap_or_default();

        Ok(PullResponse {
            records,
            server_timestamp: state.clock,
        })
    }

    async fn push(&self, request: PushRequest) -> RemoteResult<PushResponse> {
        self.pause().await;
        let mut state = self.state();
        if !state.online {
            return Err(RemoteError::Network("connection refused".to_string()));
        }

        let mut results = Vec::with_capacity(request.operations.len());
        for op in request.operations {
            let result = Self::apply(&mut state, &op);
            if result.success {
                state.pushed.push(op);
            }
            results.push(result);
        }
        Ok(PushResponse { results })
    }
}
