//! Conflict record repository

use crate::error::Result;
use crate::models::{ConflictId, ConflictRecord, EntityKey, OperationId, Payload};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::sql_limit;

const CONFLICT_COLUMNS: &str = "id, entity_type, entity_id, local_snapshot, remote_snapshot, \
     detected_at, strategy, resolved_payload, op_id";

/// `SQLite` storage for open conflict records, at most one per entity
pub struct SqliteConflictRepository<'a> {
    conn: &'a Connection,
}

struct ConflictRow {
    id: String,
    entity_type: String,
    entity_id: String,
    local_snapshot: String,
    remote_snapshot: String,
    detected_at: i64,
    strategy: String,
    resolved_payload: Option<String>,
    op_id: Option<String>,
}

impl ConflictRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            local_snapshot: row.get(3)?,
            remote_snapshot: row.get(4)?,
            detected_at: row.get(5)?,
            strategy: row.get(6)?,
            resolved_payload: row.get(7)?,
            op_id: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<ConflictRecord> {
        Ok(ConflictRecord {
            id: self.id.parse()?,
            entity_type: self.entity_type.parse()?,
            entity_id: self.entity_id.parse()?,
            local_version: serde_json::from_str(&self.local_snapshot)?,
            remote_version: serde_json::from_str(&self.remote_snapshot)?,
            detected_at: self.detected_at,
            resolution_strategy: self.strategy.parse()?,
            resolved_payload: self
                .resolved_payload
                .as_deref()
                .map(serde_json::from_str::<Payload>)
                .transpose()?,
            op_id: self
                .op_id
                .as_deref()
                .map(str::parse::<OperationId>)
                .transpose()?,
        })
    }
}

impl<'a> SqliteConflictRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert a record, or refresh the open record of the same entity.
    ///
    /// A refreshed record keeps its original id so external references stay valid.
    pub fn upsert(&self, record: &ConflictRecord) -> Result<ConflictRecord> {
        self.conn.execute(
            "INSERT INTO sync_conflicts (
                id, entity_type, entity_id, local_snapshot, remote_snapshot,
                detected_at, strategy, resolved_payload, op_id
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                local_snapshot = excluded.local_snapshot,
                remote_snapshot = excluded.remote_snapshot,
                detected_at = excluded.detected_at,
                strategy = excluded.strategy,
                resolved_payload = excluded.resolved_payload,
                op_id = excluded.op_id",
            params![
                record.id.as_str(),
                record.entity_type.as_str(),
                record.entity_id.as_str(),
                serde_json::to_string(&record.local_version)?,
                serde_json::to_string(&record.remote_version)?,
                record.detected_at,
                record.resolution_strategy.as_str(),
                record
                    .resolved_payload
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                record.op_id.as_ref().map(|op_id| op_id.as_str().to_string()),
            ],
        )?;

        let key = record.key();
        self.get_for_entity(&key)?.ok_or_else(|| {
            crate::Error::Database(format!("conflict for {key} vanished after upsert"))
        })
    }

    pub fn get(&self, id: &ConflictId) -> Result<Option<ConflictRecord>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE id = ?"),
                params![id.as_str()],
                ConflictRow::from_row,
            )
            .optional()?;
        row.map(ConflictRow::into_record).transpose()
    }

    pub fn get_for_entity(&self, key: &EntityKey) -> Result<Option<ConflictRecord>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
                     WHERE entity_type = ? AND entity_id = ?"
                ),
                params![key.entity_type.as_str(), key.id.as_str()],
                ConflictRow::from_row,
            )
            .optional()?;
        row.map(ConflictRow::into_record).transpose()
    }

    /// Open records, oldest first
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<ConflictRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
             ORDER BY detected_at ASC, id ASC
             LIMIT ?"
        ))?;
        let rows = stmt
            .query_map(params![sql_limit(limit)], ConflictRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(ConflictRow::into_record).collect()
    }

    pub fn delete(&self, id: &ConflictId) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM sync_conflicts WHERE id = ?", params![id.as_str()])?;
        Ok(rows > 0)
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM sync_conflicts", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
