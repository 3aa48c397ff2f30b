//! Data models for shopsync

mod conflict;
mod entity;
mod operation;
mod stats;

pub use conflict::{ConflictId, ConflictRecord, ManualChoice, ResolutionStrategy};
pub use entity::{Entity, EntityId, EntityKey, EntityType, Origin, Payload, SyncState};
pub use operation::{ChangeOperation, OperationId, OperationKind, OperationStatus};
pub use stats::SyncStatistics;
