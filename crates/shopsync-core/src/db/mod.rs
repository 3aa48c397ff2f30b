//! Database layer for shopsync

mod cache_repository;
mod conflict_repository;
mod connection;
mod entity_repository;
mod metadata_repository;
mod migrations;
mod operation_repository;

pub use cache_repository::SqliteCacheRepository;
pub use conflict_repository::SqliteConflictRepository;
pub use connection::Database;
pub use entity_repository::{EntityRepository, SqliteEntityRepository};
pub use metadata_repository::SqliteMetadataRepository;
pub use operation_repository::{OperationRepository, SqliteOperationRepository};

/// `LIMIT` value for an optional row cap; `SQLite` treats negative limits as unbounded
fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX))
}
