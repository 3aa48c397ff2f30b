//! Database migrations

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension};

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get::<_, i32>(0).map(|value| value != 0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i32>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);

    Ok(version)
}

fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    // Dropping the transaction without commit rolls every statement back.
    let tx = conn.unchecked_transaction()?;
    for stmt in statements {
        tx.execute(stmt, [])?;
    }
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Migration to version 1: entities, change queue and expiring cache
fn migrate_v1(conn: &Connection) -> Result<()> {
    apply(
        conn,
        1,
        &[
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            "CREATE TABLE IF NOT EXISTS entities (
                entity_type TEXT NOT NULL,
                id TEXT NOT NULL,
                payload TEXT NOT NULL,
                version INTEGER NOT NULL,
                remote_version INTEGER,
                sync_state TEXT NOT NULL,
                last_modified_at INTEGER NOT NULL,
                origin TEXT NOT NULL,
                PRIMARY KEY (entity_type, id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_entities_modified
                ON entities(entity_type, last_modified_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_entities_sync_state
                ON entities(sync_state, last_modified_at DESC)",
            "CREATE TABLE IF NOT EXISTS change_operations (
                sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                op_id TEXT NOT NULL UNIQUE,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload_delta TEXT NOT NULL,
                base_version INTEGER,
                priority INTEGER NOT NULL,
                enqueued_at INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL,
                last_error TEXT,
                status TEXT NOT NULL DEFAULT 'queued',
                next_attempt_at INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_change_operations_drain
                ON change_operations(status, priority, sequence)",
            "CREATE INDEX IF NOT EXISTS idx_change_operations_entity
                ON change_operations(entity_type, entity_id, sequence)",
            "CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER,
                updated_at INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_cache_entries_expires_at
                ON cache_entries(expires_at)",
        ],
    )
}

/// Migration to version 2: conflict records and sync metadata
fn migrate_v2(conn: &Connection) -> Result<()> {
    apply(
        conn,
        CURRENT_VERSION,
        &[
            "CREATE TABLE IF NOT EXISTS sync_conflicts (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                local_snapshot TEXT NOT NULL,
                remote_snapshot TEXT NOT NULL,
                detected_at INTEGER NOT NULL,
                strategy TEXT NOT NULL,
                resolved_payload TEXT,
                op_id TEXT,
                UNIQUE (entity_type, entity_id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_detected_at
                ON sync_conflicts(detected_at DESC)",
            "CREATE TABLE IF NOT EXISTS sync_metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [name],
            |row| row.get::<_, i32>(0),
        )
        .unwrap()
            != 0
    }

    #[test]
    fn test_migrations() {
        let conn = setup();
        run(&conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = setup();
        run(&conn).unwrap();
        run(&conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_create_all_collections() {
        let conn = setup();
        run(&conn).unwrap();

        for table in [
            "entities",
            "change_operations",
            "cache_entries",
            "sync_conflicts",
            "sync_metadata",
        ] {
            assert!(table_exists(&conn, table), "missing table {table}");
        }
    }
}
