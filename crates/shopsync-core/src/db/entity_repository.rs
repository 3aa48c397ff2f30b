//! Entity repository implementation

use crate::error::{Error, Result};
use crate::models::{Entity, EntityId, EntityType, SyncState};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::sql_limit;

const ENTITY_COLUMNS: &str =
    "entity_type, id, payload, version, remote_version, sync_state, last_modified_at, origin";

/// Trait for entity storage operations
pub trait EntityRepository {
    /// Upsert by `(type, id)` and return the record as stored.
    ///
    /// Overwriting an existing row stores `max(existing + 1, entity.version)`,
    /// so versions never go backwards; `remote_version` is stored as given.
    fn put(&self, entity: &Entity) -> Result<Entity>;

    /// Get an entity by key
    fn get(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<Entity>>;

    /// Hard delete an entity, returns whether a row existed
    fn delete(&self, entity_type: EntityType, id: &EntityId) -> Result<bool>;

    /// Update sync bookkeeping without counting as a local mutation.
    ///
    /// An acknowledged `remote_version` also lifts `version` to at least that value.
    fn set_sync_state(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        sync_state: SyncState,
        remote_version: Option<i64>,
    ) -> Result<Option<Entity>>;

    /// Entities of one type, most recently modified first
    fn query_by_type(&self, entity_type: EntityType, limit: Option<usize>) -> Result<Vec<Entity>>;

    /// Entities whose state is anything but `synced`, most recently modified first
    fn query_pending(&self, limit: Option<usize>) -> Result<Vec<Entity>>;

    /// Every persisted entity
    fn load_all(&self) -> Result<Vec<Entity>>;
}

/// `SQLite` implementation of `EntityRepository`
pub struct SqliteEntityRepository<'a> {
    conn: &'a Connection,
}

/// Raw column values, decoded into an `Entity` outside the row callback
struct EntityRow {
    entity_type: String,
    id: String,
    payload: String,
    version: i64,
    remote_version: Option<i64>,
    sync_state: String,
    last_modified_at: i64,
    origin: String,
}

impl EntityRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            entity_type: row.get(0)?,
            id: row.get(1)?,
            payload: row.get(2)?,
            version: row.get(3)?,
            remote_version: row.get(4)?,
            sync_state: row.get(5)?,
            last_modified_at: row.get(6)?,
            origin: row.get(7)?,
        })
    }

    fn into_entity(self) -> Result<Entity> {
        let payload = match serde_json::from_str::<serde_json::Value>(&self.payload)? {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(Error::Database(format!(
                    "entity {}/{} payload is not an object: {other}",
                    self.entity_type, self.id
                )))
            }
        };

        Ok(Entity {
            entity_type: self.entity_type.parse()?,
            id: self.id.parse()?,
            payload,
            version: self.version,
            remote_version: self.remote_version,
            sync_state: self.sync_state.parse()?,
            last_modified_at: self.last_modified_at,
            origin: self.origin.parse()?,
        })
    }
}

impl<'a> SqliteEntityRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn query_entities(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Entity>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, EntityRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(EntityRow::into_entity).collect()
    }
}

impl EntityRepository for SqliteEntityRepository<'_> {
    fn put(&self, entity: &Entity) -> Result<Entity> {
        // Callers serialize access to the connection, so read-then-upsert is race free.
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT version FROM entities WHERE entity_type = ? AND id = ?",
                params![entity.entity_type.as_str(), entity.id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        let mut stored = entity.clone();
        if let Some(current) = existing {
            stored.version = (current + 1).max(entity.version);
        }

        let payload = serde_json::to_string(&stored.payload)?;
        self.conn.execute(
            "INSERT INTO entities (entity_type, id, payload, version, remote_version, sync_state, last_modified_at, origin)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(entity_type, id) DO UPDATE SET
                payload = excluded.payload,
                version = excluded.version,
                remote_version = excluded.remote_version,
                sync_state = excluded.sync_state,
                last_modified_at = excluded.last_modified_at,
                origin = excluded.origin",
            params![
                stored.entity_type.as_str(),
                stored.id.as_str(),
                payload,
                stored.version,
                stored.remote_version,
                stored.sync_state.as_str(),
                stored.last_modified_at,
                stored.origin.as_str(),
            ],
        )?;

        Ok(stored)
    }

    fn get(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<Entity>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE entity_type = ? AND id = ?"),
                params![entity_type.as_str(), id.as_str()],
                EntityRow::from_row,
            )
            .optional()?;

        row.map(EntityRow::into_entity).transpose()
    }

    fn delete(&self, entity_type: EntityType, id: &EntityId) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM entities WHERE entity_type = ? AND id = ?",
            params![entity_type.as_str(), id.as_str()],
        )?;
        Ok(rows > 0)
    }

    fn set_sync_state(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        sync_state: SyncState,
        remote_version: Option<i64>,
    ) -> Result<Option<Entity>> {
        let rows = self.conn.execute(
            "UPDATE entities
             SET sync_state = ?1,
                 remote_version = COALESCE(?2, remote_version),
                 version = MAX(version, COALESCE(?2, version))
             WHERE entity_type = ?3 AND id = ?4",
            params![
                sync_state.as_str(),
                remote_version,
                entity_type.as_str(),
                id.as_str()
            ],
        )?;

        if rows == 0 {
            return Ok(None);
        }
        self.get(entity_type, id)
    }

    fn query_by_type(&self, entity_type: EntityType, limit: Option<usize>) -> Result<Vec<Entity>> {
        self.query_entities(
            &format!(
                "SELECT {ENTITY_COLUMNS} FROM entities
                 WHERE entity_type = ?
                 ORDER BY last_modified_at DESC
                 LIMIT ?"
            ),
            params![entity_type.as_str(), sql_limit(limit)],
        )
    }

    fn query_pending(&self, limit: Option<usize>) -> Result<Vec<Entity>> {
        self.query_entities(
            &format!(
                "SELECT {ENTITY_COLUMNS} FROM entities
                 WHERE sync_state != 'synced'
                 ORDER BY last_modified_at DESC
                 LIMIT ?"
            ),
            params![sql_limit(limit)],
        )
    }

    fn load_all(&self) -> Result<Vec<Entity>> {
        self.query_entities(
            &format!("SELECT {ENTITY_COLUMNS} FROM entities ORDER BY entity_type, id"),
            [],
        )
    }
}
