pub mod cache;
pub mod common;
pub mod conflicts;
pub mod entity;
pub mod operations;
pub mod sync;
