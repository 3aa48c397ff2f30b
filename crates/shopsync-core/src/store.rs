//! Durable local store shared by the cache, queue and orchestrator.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;
use serde_json::Value;

use crate::cache::{CacheEvent, EntityCache};
use crate::db::{
    Database, EntityRepository, OperationRepository, SqliteCacheRepository,
    SqliteConflictRepository, SqliteEntityRepository, SqliteMetadataRepository,
    SqliteOperationRepository,
};
use crate::models::{
    ChangeOperation, ConflictId, ConflictRecord, Entity, EntityId, EntityKey, EntityType,
    OperationId, SyncState,
};
use crate::util::now_millis;
use crate::{Error, Result};

/// Thread-safe handle to the on-device store.
///
/// Every call runs on one `SQLite` connection behind a mutex, so each
/// operation is its own transaction unless grouped with [`LocalStore::transaction`].
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl LocalStore {
    /// Open the store at the given filesystem path.
    ///
    /// A file that is not a database is moved aside and a fresh store is created.
    pub fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = match Database::open(&db_path) {
            Ok(db) => db,
            Err(error) if Self::is_corrupted_db_error(&error) => {
                tracing::warn!(
                    "Detected unreadable store at {}: {}. Moving it aside and starting fresh.",
                    db_path.display(),
                    error
                );
                Self::quarantine_corrupted_db_files(&db_path)?;
                Database::open(&db_path)?
            }
            Err(error) => return Err(error),
        };

        let store = Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        };
        store.recover_in_flight()?;
        Ok(store)
    }

    /// Open an in-memory store (primarily for tests).
    pub fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|_| Error::Database("store lock poisoned".to_string()))
    }

    /// Run `f` against the connection.
    pub(crate) fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let db = self.lock()?;
        f(db.connection())
    }

    /// Run `f` inside one transaction; an error rolls everything back.
    pub(crate) fn transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let db = self.lock()?;
        let tx = db.connection().unchecked_transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run `f` in one transaction and mirror the cache changes it returns.
    ///
    /// The cache is updated after the commit but before the store lock is
    /// released, so it sees writes in commit order. Subscribers run after the
    /// lock is dropped.
    pub(crate) fn commit_with_cache<T>(
        &self,
        cache: &EntityCache,
        f: impl FnOnce(&Connection) -> Result<(T, Vec<CacheEvent>)>,
    ) -> Result<T> {
        let (value, staged) = {
            let db = self.lock()?;
            let tx = db.connection().unchecked_transaction()?;
            let (value, changes) = f(&tx)?;
            tx.commit()?;
            (value, cache.stage(changes))
        };
        staged.deliver();
        Ok(value)
    }

    fn is_corrupted_db_error(error: &Error) -> bool {
        let message = error.to_string().to_ascii_lowercase();
        message.contains("file is not a database") || message.contains("malformed")
    }

    fn quarantine_corrupted_db_files(db_path: &Path) -> Result<()> {
        let Some(base_name) = db_path.file_name().and_then(|name| name.to_str()) else {
            return Ok(());
        };
        let timestamp = now_millis();

        for suffix in ["", "-wal", "-shm"] {
            let path = db_path.with_file_name(format!("{base_name}{suffix}"));
            if !path.exists() {
                continue;
            }
            let backup_path =
                db_path.with_file_name(format!("{base_name}{suffix}.corrupt-{timestamp}"));
            std::fs::rename(&path, &backup_path)?;
            tracing::warn!(
                "Moved unreadable store file from {} to {}",
                path.display(),
                backup_path.display()
            );
        }

        Ok(())
    }

    /// Return operations left in flight by an interrupted pass to the queue.
    pub fn recover_in_flight(&self) -> Result<usize> {
        let recovered = self.with_connection(|conn| {
            SqliteOperationRepository::new(conn).reset_in_flight()
        })?;
        if recovered > 0 {
            tracing::info!(recovered, "Requeued operations left in flight");
        }
        Ok(recovered)
    }

    // -----------------------------------------------------------------------
    // Entities
    // -----------------------------------------------------------------------

    /// Upsert an entity and return it as stored (see [`EntityRepository::put`]).
    pub fn put(&self, entity: &Entity) -> Result<Entity> {
        self.with_connection(|conn| SqliteEntityRepository::new(conn).put(entity))
    }

    pub fn get(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<Entity>> {
        self.with_connection(|conn| SqliteEntityRepository::new(conn).get(entity_type, id))
    }

    pub fn delete(&self, entity_type: EntityType, id: &EntityId) -> Result<bool> {
        self.with_connection(|conn| SqliteEntityRepository::new(conn).delete(entity_type, id))
    }

    pub fn set_sync_state(
        &self,
        key: &EntityKey,
        sync_state: SyncState,
        remote_version: Option<i64>,
    ) -> Result<Option<Entity>> {
        self.with_connection(|conn| {
            SqliteEntityRepository::new(conn).set_sync_state(
                key.entity_type,
                &key.id,
                sync_state,
                remote_version,
            )
        })
    }

    pub fn query_by_type(
        &self,
        entity_type: EntityType,
        limit: Option<usize>,
    ) -> Result<Vec<Entity>> {
        self.with_connection(|conn| {
            SqliteEntityRepository::new(conn).query_by_type(entity_type, limit)
        })
    }

    pub fn query_pending(&self, limit: Option<usize>) -> Result<Vec<Entity>> {
        self.with_connection(|conn| SqliteEntityRepository::new(conn).query_pending(limit))
    }

    pub fn load_all(&self) -> Result<Vec<Entity>> {
        self.with_connection(|conn| SqliteEntityRepository::new(conn).load_all())
    }

    // -----------------------------------------------------------------------
    // Change operations
    // -----------------------------------------------------------------------

    /// Persist an operation in its own transaction, independent of entity writes.
    pub fn enqueue_operation(&self, op: &ChangeOperation) -> Result<ChangeOperation> {
        self.with_connection(|conn| SqliteOperationRepository::new(conn).insert(op))
    }

    /// Remove an operation, returns whether it existed.
    pub fn dequeue_operation(&self, op_id: &OperationId) -> Result<bool> {
        self.with_connection(|conn| SqliteOperationRepository::new(conn).delete(op_id))
    }

    pub fn get_operation(&self, op_id: &OperationId) -> Result<Option<ChangeOperation>> {
        self.with_connection(|conn| SqliteOperationRepository::new(conn).get(op_id))
    }

    // -----------------------------------------------------------------------
    // Expiring cache
    // -----------------------------------------------------------------------

    pub fn cache_set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<()> {
        if key.trim().is_empty() {
            return Err(Error::InvalidInput("cache key cannot be empty".into()));
        }
        let now = now_millis();
        let expires_at = ttl.map(|ttl| {
            now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
        });
        self.with_connection(|conn| {
            SqliteCacheRepository::new(conn).set(key, value, expires_at, now)
        })
    }

    /// Read a cached value; an expired key is deleted and reported missing.
    pub fn cache_get(&self, key: &str) -> Result<Option<Value>> {
        self.with_connection(|conn| SqliteCacheRepository::new(conn).get(key, now_millis()))
    }

    pub fn cache_remove(&self, key: &str) -> Result<bool> {
        self.with_connection(|conn| SqliteCacheRepository::new(conn).remove(key))
    }

    pub fn purge_expired_cache(&self) -> Result<usize> {
        let purged = self.with_connection(|conn| {
            SqliteCacheRepository::new(conn).purge_expired(now_millis())
        })?;
        tracing::debug!(purged, "Purged expired cache entries");
        Ok(purged)
    }

    // -----------------------------------------------------------------------
    // Conflicts
    // -----------------------------------------------------------------------

    pub fn upsert_conflict(&self, record: &ConflictRecord) -> Result<ConflictRecord> {
        self.with_connection(|conn| SqliteConflictRepository::new(conn).upsert(record))
    }

    pub fn get_conflict(&self, id: &ConflictId) -> Result<Option<ConflictRecord>> {
        self.with_connection(|conn| SqliteConflictRepository::new(conn).get(id))
    }

    pub fn conflict_for_entity(&self, key: &EntityKey) -> Result<Option<ConflictRecord>> {
        self.with_connection(|conn| SqliteConflictRepository::new(conn).get_for_entity(key))
    }

    pub fn list_conflicts(&self, limit: Option<usize>) -> Result<Vec<ConflictRecord>> {
        self.with_connection(|conn| SqliteConflictRepository::new(conn).list(limit))
    }

    pub fn delete_conflict(&self, id: &ConflictId) -> Result<bool> {
        self.with_connection(|conn| SqliteConflictRepository::new(conn).delete(id))
    }

    pub fn conflict_count(&self) -> Result<usize> {
        self.with_connection(|conn| SqliteConflictRepository::new(conn).count())
    }

    // -----------------------------------------------------------------------
    // Sync metadata
    // -----------------------------------------------------------------------

    pub fn pull_cursor(&self, entity_type: EntityType) -> Result<Option<i64>> {
        self.with_connection(|conn| SqliteMetadataRepository::new(conn).pull_cursor(entity_type))
    }

    pub fn last_sync_time(&self) -> Result<Option<i64>> {
        self.with_connection(|conn| SqliteMetadataRepository::new(conn).last_sync_time())
    }

    /// Commit the cursors gathered by a completed pass together with its timestamp.
    pub fn record_sync_completed(
        &self,
        cursors: &[(EntityType, i64)],
        completed_at: i64,
    ) -> Result<()> {
        self.transaction(|conn| {
            let repo = SqliteMetadataRepository::new(conn);
            for (entity_type, cursor) in cursors {
                repo.set_pull_cursor(*entity_type, *cursor)?;
            }
            repo.set_last_sync_time(completed_at)
        })
    }
}
