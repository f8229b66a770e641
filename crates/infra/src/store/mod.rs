//! Batch record persistence boundary.
//!
//! One record per batch key, with per-key locking so that at most one worker runs a
//! job's chunk at a time.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryRecordStore;
pub use postgres::PostgresRecordStore;
pub use r#trait::{IfMissing, LockMode, LockedRecord, Lookup, RecordStore, StoreConfig, StoreError};
