//! shopsync-core - Core library for shopsync
//!
//! This crate contains the local store, change queue, conflict resolution and
//! sync orchestration shared by every shopsync client (desktop, CLI, services).

pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod models;
pub mod queue;
pub mod resolver;
pub mod state;
pub mod store;
pub mod sync;
pub mod util;

pub use cache::{CacheEvent, EntityCache, SubscriptionId};
pub use config::SyncSettings;
pub use context::SyncContext;
pub use error::{Error, Result};
pub use models::{
    ChangeOperation, ConflictId, ConflictRecord, Entity, EntityId, EntityKey, EntityType,
    ManualChoice, OperationId, OperationKind, Payload, SyncState, SyncStatistics,
};
pub use queue::ChangeQueue;
pub use resolver::ConflictResolver;
pub use state::OrchestratorState;
pub use store::LocalStore;
