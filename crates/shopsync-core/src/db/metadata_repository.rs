//! Sync metadata repository (pull cursors, last sync time)

use crate::error::Result;
use crate::models::EntityType;
use rusqlite::{params, Connection, OptionalExtension};

const LAST_SYNC_TIME_KEY: &str = "last_sync_time";

fn pull_cursor_key(entity_type: EntityType) -> String {
    format!("pull_cursor:{}", entity_type.as_str())
}

/// Key/value store for sync bookkeeping
pub struct SqliteMetadataRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteMetadataRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Server timestamp to pass as `since` for the next pull of `entity_type`
    pub fn pull_cursor(&self, entity_type: EntityType) -> Result<Option<i64>> {
        self.get_i64(&pull_cursor_key(entity_type))
    }

    pub fn set_pull_cursor(&self, entity_type: EntityType, server_timestamp: i64) -> Result<()> {
        self.set_setting(&pull_cursor_key(entity_type), &server_timestamp.to_string())
    }

    /// Unix ms of the last completed sync pass
    pub fn last_sync_time(&self) -> Result<Option<i64>> {
        self.get_i64(LAST_SYNC_TIME_KEY)
    }

    pub fn set_last_sync_time(&self, timestamp: i64) -> Result<()> {
        self.set_setting(LAST_SYNC_TIME_KEY, &timestamp.to_string())
    }

    fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        let value = self.get_setting(key)?;
        Ok(value.and_then(|value| match value.parse() {
            Ok(parsed) => Some(parsed),
            Err(error) => {
                tracing::warn!(key, %error, "Ignoring unreadable sync metadata value");
                None
            }
        }))
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM sync_metadata WHERE key = ?",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_metadata (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }
}
