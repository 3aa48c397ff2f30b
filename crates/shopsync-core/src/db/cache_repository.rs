//! Expiring key/value cache repository

use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

/// `SQLite` implementation of the generic expiring cache
pub struct SqliteCacheRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteCacheRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert or replace `key`; `expires_at` is Unix ms, `None` never expires
    pub fn set(&self, key: &str, value: &Value, expires_at: Option<i64>, now: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO cache_entries (key, value, expires_at, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at",
            params![key, serde_json::to_string(value)?, expires_at, now],
        )?;
        Ok(())
    }

    /// Read `key`, deleting it instead when it has expired at `now`
    pub fn get(&self, key: &str, now: i64) -> Result<Option<Value>> {
        let row: Option<(String, Option<i64>)> = self
            .conn
            .query_row(
                "SELECT value, expires_at FROM cache_entries WHERE key = ?",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((raw, expires_at)) = row else {
            return Ok(None);
        };

        if expires_at.is_some_and(|expires_at| expires_at <= now) {
            // Only delete the row we saw expire; a concurrent refresh wins.
            self.conn.execute(
                "DELETE FROM cache_entries WHERE key = ? AND expires_at <= ?",
                params![key, now],
            )?;
            return Ok(None);
        }

        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Remove `key`, returns whether it existed
    pub fn remove(&self, key: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM cache_entries WHERE key = ?", params![key])?;
        Ok(rows > 0)
    }

    /// Delete every entry expired at `now`, returns how many were removed
    pub fn purge_expired(&self, now: i64) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= ?",
            params![now],
        )?;
        Ok(rows)
    }
}
