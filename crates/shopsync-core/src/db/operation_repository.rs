//! Change operation repository implementation

use crate::error::{Error, Result};
use crate::models::{ChangeOperation, EntityKey, OperationId, OperationStatus, Payload};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::sql_limit;

const OPERATION_COLUMNS: &str = "sequence, op_id, entity_type, entity_id, kind, payload_delta, \
     base_version, priority, enqueued_at, retry_count, max_retries, last_error, status, next_attempt_at";

/// Trait for change-queue storage operations
pub trait OperationRepository {
    /// Append an operation and return it with its assigned sequence
    fn insert(&self, op: &ChangeOperation) -> Result<ChangeOperation>;

    /// Get an operation by id
    fn get(&self, op_id: &OperationId) -> Result<Option<ChangeOperation>>;

    /// Remove an operation, returns whether it existed
    fn delete(&self, op_id: &OperationId) -> Result<bool>;

    /// Persist the mutable bookkeeping of an existing operation
    fn update(&self, op: &ChangeOperation) -> Result<()>;

    /// Queued and in-flight operations in enqueue order
    fn list_active(&self) -> Result<Vec<ChangeOperation>>;

    /// Queued and in-flight operations for one entity in enqueue order
    fn list_active_for_entity(&self, key: &EntityKey) -> Result<Vec<ChangeOperation>>;

    /// Operations whose retries are exhausted, newest first
    fn list_failed(&self, limit: Option<usize>) -> Result<Vec<ChangeOperation>>;

    /// Move the given operations to `status`, returns rows changed
    fn set_status(&self, op_ids: &[OperationId], status: OperationStatus) -> Result<usize>;

    /// Return every in-flight operation to the queue
    fn reset_in_flight(&self) -> Result<usize>;

    /// Drop queued and in-flight operations of one entity
    fn delete_active_for_entity(&self, key: &EntityKey) -> Result<usize>;

    /// Number of operations with the given status
    fn count_by_status(&self, status: OperationStatus) -> Result<usize>;
}

/// `SQLite` implementation of `OperationRepository`
pub struct SqliteOperationRepository<'a> {
    conn: &'a Connection,
}

struct OperationRow {
    sequence: i64,
    op_id: String,
    entity_type: String,
    entity_id: String,
    kind: String,
    payload_delta: String,
    base_version: Option<i64>,
    priority: u8,
    enqueued_at: i64,
    retry_count: u32,
    max_retries: u32,
    last_error: Option<String>,
    status: String,
    next_attempt_at: i64,
}

impl OperationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sequence: row.get(0)?,
            op_id: row.get(1)?,
            entity_type: row.get(2)?,
            entity_id: row.get(3)?,
            kind: row.get(4)?,
            payload_delta: row.get(5)?,
            base_version: row.get(6)?,
            priority: row.get(7)?,
            enqueued_at: row.get(8)?,
            retry_count: row.get(9)?,
            max_retries: row.get(10)?,
            last_error: row.get(11)?,
            status: row.get(12)?,
            next_attempt_at: row.get(13)?,
        })
    }

    fn into_operation(self) -> Result<ChangeOperation> {
        let payload_delta = serde_json::from_str::<Payload>(&self.payload_delta).map_err(|error| {
            Error::Database(format!(
                "operation {} has an unreadable payload: {error}",
                self.op_id
            ))
        })?;

        Ok(ChangeOperation {
            op_id: self.op_id.parse()?,
            sequence: self.sequence,
            entity_type: self.entity_type.parse()?,
            entity_id: self.entity_id.parse()?,
            kind: self.kind.parse()?,
            payload_delta,
            base_version: self.base_version,
            priority: self.priority,
            enqueued_at: self.enqueued_at,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            last_error: self.last_error,
            status: self.status.parse()?,
            next_attempt_at: self.next_attempt_at,
        })
    }
}

impl<'a> SqliteOperationRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn query_operations(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ChangeOperation>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, OperationRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(OperationRow::into_operation).collect()
    }
}

impl OperationRepository for SqliteOperationRepository<'_> {
    fn insert(&self, op: &ChangeOperation) -> Result<ChangeOperation> {
        self.conn.execute(
            "INSERT INTO change_operations (
                op_id, entity_type, entity_id, kind, payload_delta, base_version, priority,
                enqueued_at, retry_count, max_retries, last_error, status, next_attempt_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                op.op_id.as_str(),
                op.entity_type.as_str(),
                op.entity_id.as_str(),
                op.kind.as_str(),
                serde_json::to_string(&op.payload_delta)?,
                op.base_version,
                op.priority,
                op.enqueued_at,
                op.retry_count,
                op.max_retries,
                op.last_error,
                op.status.as_str(),
                op.next_attempt_at,
            ],
        )?;

        let mut stored = op.clone();
        stored.sequence = self.conn.last_insert_rowid();
        Ok(stored)
    }

    fn get(&self, op_id: &OperationId) -> Result<Option<ChangeOperation>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {OPERATION_COLUMNS} FROM change_operations WHERE op_id = ?"),
                params![op_id.as_str()],
                OperationRow::from_row,
            )
            .optional()?;

        row.map(OperationRow::into_operation).transpose()
    }

    fn delete(&self, op_id: &OperationId) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM change_operations WHERE op_id = ?",
            params![op_id.as_str()],
        )?;
        Ok(rows > 0)
    }

    fn update(&self, op: &ChangeOperation) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE change_operations
             SET payload_delta = ?, base_version = ?, retry_count = ?, last_error = ?,
                 status = ?, next_attempt_at = ?
             WHERE op_id = ?",
            params![
                serde_json::to_string(&op.payload_delta)?,
                op.base_version,
                op.retry_count,
                op.last_error,
                op.status.as_str(),
                op.next_attempt_at,
                op.op_id.as_str(),
            ],
        )?;

        if rows == 0 {
            return Err(Error::NotFound(format!("operation {}", op.op_id)));
        }
        Ok(())
    }

    fn list_active(&self) -> Result<Vec<ChangeOperation>> {
        self.query_operations(
            &format!(
                "SELECT {OPERATION_COLUMNS} FROM change_operations
                 WHERE status IN ('queued', 'in_flight')
                 ORDER BY sequence ASC"
            ),
            [],
        )
    }

    fn list_active_for_entity(&self, key: &EntityKey) -> Result<Vec<ChangeOperation>> {
        self.query_operations(
            &format!(
                "SELECT {OPERATION_COLUMNS} FROM change_operations
                 WHERE entity_type = ? AND entity_id = ? AND status IN ('queued', 'in_flight')
                 ORDER BY sequence ASC"
            ),
            params![key.entity_type.as_str(), key.id.as_str()],
        )
    }

    fn list_failed(&self, limit: Option<usize>) -> Result<Vec<ChangeOperation>> {
        self.query_operations(
            &format!(
                "SELECT {OPERATION_COLUMNS} FROM change_operations
                 WHERE status = 'failed'
                 ORDER BY sequence DESC
                 LIMIT ?"
            ),
            params![sql_limit(limit)],
        )
    }

    fn set_status(&self, op_ids: &[OperationId], status: OperationStatus) -> Result<usize> {
        let mut stmt = self
            .conn
            .prepare("UPDATE change_operations SET status = ? WHERE op_id = ?")?;
        let mut changed = 0;
        for op_id in op_ids {
            changed += stmt.execute(params![status.as_str(), op_id.as_str()])?;
        }
        Ok(changed)
    }

    fn reset_in_flight(&self) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE change_operations SET status = 'queued' WHERE status = 'in_flight'",
            [],
        )?;
        Ok(rows)
    }

    fn delete_active_for_entity(&self, key: &EntityKey) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM change_operations
             WHERE entity_type = ? AND entity_id = ? AND status IN ('queued', 'in_flight')",
            params![key.entity_type.as_str(), key.id.as_str()],
        )?;
        Ok(rows)
    }

    fn count_by_status(&self, status: OperationStatus) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM change_operations WHERE status = ?",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{EntityType, OperationKind};
    use serde_json::json;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn operation(entity_id: &str, kind: OperationKind) -> ChangeOperation {
        ChangeOperation {
            op_id: OperationId::new(),
            sequence: 0,
            entity_type: EntityType::ServiceOrder,
            entity_id: entity_id.parse().unwrap(),
            kind,
            payload_delta: json!({ "status": "open" }).as_object().unwrap().clone(),
            base_version: None,
            priority: 2,
            enqueued_at: 10,
            retry_count: 0,
            max_retries: 3,
            last_error: None,
            status: OperationStatus::Queued,
            next_attempt_at: 10,
        }
    }

    #[test]
    fn test_insert_assigns_increasing_sequence() {
        let db = setup();
        let repo = SqliteOperationRepository::new(db.connection());

        let first = repo.insert(&operation("SO1", OperationKind::Create)).unwrap();
        let second = repo.insert(&operation("SO1", OperationKind::Update)).unwrap();
        assert!(second.sequence > first.sequence);

        let fetched = repo.get(&first.op_id).unwrap().unwrap();
        assert_eq!(fetched, first);
    }

    #[test]
    fn test_update_and_status_transitions() {
        let db = setup();
        let repo = SqliteOperationRepository::new(db.connection());
        let mut op = repo.insert(&operation("SO1", OperationKind::Update)).unwrap();

        repo.set_status(std::slice::from_ref(&op.op_id), OperationStatus::InFlight)
            .unwrap();
        assert_eq!(repo.count_by_status(OperationStatus::InFlight).unwrap(), 1);

        assert_eq!(repo.reset_in_flight().unwrap(), 1);
        assert_eq!(repo.count_by_status(OperationStatus::Queued).unwrap(), 1);

        op.retry_count = 3;
        op.status = OperationStatus::Failed;
        op.last_error = Some("rejected".to_string());
        repo.update(&op).unwrap();

        let failed = repo.list_failed(None).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("rejected"));
        assert!(repo.list_active().unwrap().is_empty());
    }

    #[test]
    fn test_update_missing_operation_errors() {
        let db = setup();
        let repo = SqliteOperationRepository::new(db.connection());
        let result = repo.update(&operation("SO1", OperationKind::Update));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_entity_scoped_queries() {
        let db = setup();
        let repo = SqliteOperationRepository::new(db.connection());
        repo.insert(&operation("SO1", OperationKind::Create)).unwrap();
        repo.insert(&operation("SO1", OperationKind::Update)).unwrap();
        repo.insert(&operation("SO2", OperationKind::Create)).unwrap();

        let key = EntityKey::new(EntityType::ServiceOrder, "SO1".parse().unwrap());
        let ops = repo.list_active_for_entity(&key).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].kind, OperationKind::Create);

        assert_eq!(repo.delete_active_for_entity(&key).unwrap(), 2);
        assert_eq!(repo.list_active().unwrap().len(), 1);
    }
}
