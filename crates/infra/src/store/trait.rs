use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use chunkline_core::{BatchError, BatchKey, BatchRecord, LeaseToken};

/// How `find` treats the record's lock.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LockMode {
    /// Plain read; no lock is taken.
    None,
    /// Take the lock if free, otherwise report contention immediately.
    SkipIfLocked,
    /// Wait (up to the store's lock wait) until the lock is free.
    Wait,
}

/// What `find` does when no record exists for the key.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IfMissing {
    /// Report the record as absent.
    Absent,
    /// Create an empty record whose run starts at the given instant.
    Create(DateTime<Utc>),
}

/// A loaded record plus the lease held on it (if a lock was requested).
#[derive(Debug, Clone)]
pub struct LockedRecord {
    pub record: BatchRecord,
    pub lease: Option<LeaseToken>,
}

/// Outcome of a lookup.
#[derive(Debug, Clone)]
pub enum Lookup {
    Found(LockedRecord),
    Absent,
    /// Another holder owns the lock (only with [`LockMode::SkipIfLocked`]).
    Contended,
}

/// Store tuning shared by the implementations.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long a lock stays valid without release (covers crashed holders).
    pub lease_ttl: Duration,
    /// Upper bound for [`LockMode::Wait`].
    pub lock_wait: Duration,
    /// Re-check interval while waiting for a lock.
    pub lock_poll: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(2 * 60 * 60),
            lock_wait: Duration::from_secs(61 * 60),
            lock_poll: Duration::from_millis(50),
        }
    }
}

impl StoreConfig {
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }
}

/// Record store error.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("timed out waiting for lock on {0}")]
    LockTimeout(String),
    #[error("lease on {0} is not held by this token")]
    LeaseMismatch(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for BatchError {
    fn from(err: StoreError) -> Self {
        BatchError::Store(err.to_string())
    }
}

/// Persistent key-value store for batch records with per-key locking.
///
/// Keys are the records' full store keys (`batch-record-<suffix>`). A lock obtained
/// through `find` must be given back with `release`; leases expire after the store's
/// TTL so a crashed holder cannot block a job forever.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Load a record, optionally locking it and creating it when missing.
    async fn find(
        &self,
        key: &BatchKey,
        mode: LockMode,
        if_missing: IfMissing,
    ) -> Result<Lookup, StoreError>;

    /// Lock a record, creating an empty one started at `now` when missing.
    async fn lock(
        &self,
        key: &BatchKey,
        mode: LockMode,
        now: DateTime<Utc>,
    ) -> Result<Lookup, StoreError> {
        self.find(key, mode, IfMissing::Create(now)).await
    }

    /// Give back a lock. Releasing a lease on a deleted record is not an error.
    async fn release(&self, key: &BatchKey, lease: LeaseToken) -> Result<(), StoreError>;

    /// Insert or overwrite the record (its lock is left as is).
    async fn save(&self, record: &BatchRecord) -> Result<(), StoreError>;

    /// Delete the record; returns whether it existed.
    async fn delete(&self, key: &BatchKey) -> Result<bool, StoreError>;

    /// All records whose store key starts with `prefix`, ordered by key.
    async fn find_by_key_prefix(&self, prefix: &str) -> Result<Vec<BatchRecord>, StoreError>;
}

#[async_trait::async_trait]
impl<S> RecordStore for Arc<S>
where
    S: RecordStore + ?Sized,
{
    async fn find(
        &self,
        key: &BatchKey,
        mode: LockMode,
        if_missing: IfMissing,
    ) -> Result<Lookup, StoreError> {
        (**self).find(key, mode, if_missing).await
    }

    async fn release(&self, key: &BatchKey, lease: LeaseToken) -> Result<(), StoreError> {
        (**self).release(key, lease).await
    }

    async fn save(&self, record: &BatchRecord) -> Result<(), StoreError> {
        (**self).save(record).await
    }

    async fn delete(&self, key: &BatchKey) -> Result<bool, StoreError> {
        (**self).delete(key).await
    }

    async fn find_by_key_prefix(&self, prefix: &str) -> Result<Vec<BatchRecord>, StoreError> {
        (**self).find_by_key_prefix(prefix).await
    }
}
