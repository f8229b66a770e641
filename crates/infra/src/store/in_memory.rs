use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;

use chunkline_core::record::{saturating_add, to_chrono};
use chunkline_core::{BatchKey, BatchRecord, LeaseToken};

use super::r#trait::{IfMissing, LockMode, LockedRecord, Lookup, RecordStore, StoreConfig, StoreError};

#[derive(Debug, Clone)]
struct Lease {
    token: LeaseToken,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Entry {
    record: BatchRecord,
    lease: Option<Lease>,
}

impl Entry {
    fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| l.expires_at > now)
    }
}

/// In-memory record store for tests/dev.
///
/// Leases use wall-clock time so that a test clock driving record derivations never
/// expires locks by accident.
#[derive(Debug)]
pub struct InMemoryRecordStore {
    entries: RwLock<BTreeMap<String, Entry>>,
    released: Notify,
    config: StoreConfig,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            released: Notify::new(),
            config,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a live lease is held on the key.
    pub fn is_locked(&self, key: &BatchKey) -> bool {
        self.entries
            .read()
            .ok()
            .and_then(|e| e.get(&key.record_key()).map(|entry| entry.is_locked(Utc::now())))
            .unwrap_or(false)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Entry>>, StoreError> {
        self.entries
            .write()
            .map_err(|_| StoreError::Storage("record map lock poisoned".to_string()))
    }

    /// One locking attempt. `Ok(None)` means the lock is currently held elsewhere.
    fn try_find(
        &self,
        key: &BatchKey,
        mode: LockMode,
        if_missing: IfMissing,
    ) -> Result<Option<Lookup>, StoreError> {
        let mut entries = self.write()?;
        let record_key = key.record_key();

        if !entries.contains_key(&record_key) {
            match if_missing {
                IfMissing::Absent => return Ok(Some(Lookup::Absent)),
                IfMissing::Create(now) => {
                    entries.insert(
                        record_key.clone(),
                        Entry {
                            record: BatchRecord::new(key.clone(), now),
                            lease: None,
                        },
                    );
                }
            }
        }

        let Some(entry) = entries.get_mut(&record_key) else {
            return Ok(Some(Lookup::Absent));
        };

        if mode == LockMode::None {
            return Ok(Some(Lookup::Found(LockedRecord {
                record: entry.record.clone(),
                lease: None,
            })));
        }

        let now = Utc::now();
        if entry.is_locked(now) {
            return Ok(None);
        }

        let token = LeaseToken::new();
        entry.lease = Some(Lease {
            token,
            expires_at: saturating_add(now, to_chrono(self.config.lease_ttl)),
        });

        Ok(Some(Lookup::Found(LockedRecord {
            record: entry.record.clone(),
            lease: Some(token),
        })))
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn find(
        &self,
        key: &BatchKey,
        mode: LockMode,
        if_missing: IfMissing,
    ) -> Result<Lookup, StoreError> {
        let give_up_at = Instant::now() + self.config.lock_wait;

        loop {
            let released = self.released.notified();
            if let Some(lookup) = self.try_find(key, mode, if_missing)? {
                return Ok(lookup);
            }

            match mode {
                LockMode::SkipIfLocked => return Ok(Lookup::Contended),
                LockMode::None => unreachable!("plain reads never contend"),
                LockMode::Wait => {
                    let now = Instant::now();
                    if now >= give_up_at {
                        return Err(StoreError::LockTimeout(key.record_key()));
                    }
                    let wait = (give_up_at - now).min(self.config.lock_poll);
                    let _ = tokio::time::timeout(wait, released).await;
                }
            }
        }
    }

    async fn release(&self, key: &BatchKey, lease: LeaseToken) -> Result<(), StoreError> {
        {
            let mut entries = self.write()?;
            if let Some(entry) = entries.get_mut(&key.record_key()) {
                match &entry.lease {
                    Some(held) if held.token == lease => entry.lease = None,
                    Some(_) => return Err(StoreError::LeaseMismatch(key.record_key())),
                    None => {}
                }
            }
        }
        self.released.notify_waiters();
        Ok(())
    }

    async fn save(&self, record: &BatchRecord) -> Result<(), StoreError> {
        let mut entries = self.write()?;
        entries
            .entry(record.record_key())
            .and_modify(|e| e.record = record.clone())
            .or_insert_with(|| Entry {
                record: record.clone(),
                lease: None,
            });
        Ok(())
    }

    async fn delete(&self, key: &BatchKey) -> Result<bool, StoreError> {
        let existed = self.write()?.remove(&key.record_key()).is_some();
        self.released.notify_waiters();
        Ok(existed)
    }

    async fn find_by_key_prefix(&self, prefix: &str) -> Result<Vec<BatchRecord>, StoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| StoreError::Storage("record map lock poisoned".to_string()))?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, e)| e.record.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn key(s: &str) -> BatchKey {
        BatchKey::new(s).unwrap()
    }

    fn found(lookup: Lookup) -> LockedRecord {
        match lookup {
            Lookup::Found(l) => l,
            other => panic!("expected a record, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn plain_find_does_not_create() {
        let store = InMemoryRecordStore::new();
        let lookup = store
            .find(&key("a"), LockMode::None, IfMissing::Absent)
            .await
            .unwrap();
        assert!(matches!(lookup, Lookup::Absent));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn lock_creates_empty_record() {
        let store = InMemoryRecordStore::new();
        let now = Utc::now();
        let locked = found(store.lock(&key("a"), LockMode::Wait, now).await.unwrap());
        assert_eq!(locked.record.started_at(), now);
        assert!(locked.lease.is_some());
        assert!(store.is_locked(&key("a")));
    }

    #[tokio::test]
    async fn skip_if_locked_reports_contention() {
        let store = InMemoryRecordStore::new();
        let first = found(
            store
                .lock(&key("a"), LockMode::SkipIfLocked, Utc::now())
                .await
                .unwrap(),
        );

        let second = store
            .find(&key("a"), LockMode::SkipIfLocked, IfMissing::Absent)
            .await
            .unwrap();
        assert!(matches!(second, Lookup::Contended));

        store.release(&key("a"), first.lease.unwrap()).await.unwrap();
        let third = store
            .find(&key("a"), LockMode::SkipIfLocked, IfMissing::Absent)
            .await
            .unwrap();
        assert!(matches!(third, Lookup::Found(_)));
    }

    #[tokio::test]
    async fn wait_times_out_while_held() {
        let store = InMemoryRecordStore::with_config(
            StoreConfig::default().with_lock_wait(Duration::from_millis(60)),
        );
        let _held = found(store.lock(&key("a"), LockMode::Wait, Utc::now()).await.unwrap());

        let err = store
            .find(&key("a"), LockMode::Wait, IfMissing::Absent)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout(_)));
    }

    #[tokio::test]
    async fn wait_acquires_after_release() {
        let store = Arc::new(InMemoryRecordStore::new());
        let held = found(store.lock(&key("a"), LockMode::Wait, Utc::now()).await.unwrap());

        let releaser = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                store.release(&key("a"), held.lease.unwrap()).await.unwrap();
            })
        };

        let lookup = store
            .find(&key("a"), LockMode::Wait, IfMissing::Absent)
            .await
            .unwrap();
        assert!(matches!(lookup, Lookup::Found(_)));
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let store = InMemoryRecordStore::with_config(
            StoreConfig::default().with_lease_ttl(Duration::from_millis(1)),
        );
        let _stale = found(store.lock(&key("a"), LockMode::Wait, Utc::now()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;

        let lookup = store
            .find(&key("a"), LockMode::SkipIfLocked, IfMissing::Absent)
            .await
            .unwrap();
        assert!(matches!(lookup, Lookup::Found(_)));
    }

    #[tokio::test]
    async fn release_with_foreign_token_is_rejected() {
        let store = InMemoryRecordStore::new();
        let _held = found(store.lock(&key("a"), LockMode::Wait, Utc::now()).await.unwrap());
        let err = store.release(&key("a"), LeaseToken::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseMismatch(_)));
    }

    #[tokio::test]
    async fn prefix_scan_and_delete() {
        let store = InMemoryRecordStore::new();
        let now = Utc::now();
        for k in ["a", "b", "c"] {
            store.save(&BatchRecord::new(key(k), now)).await.unwrap();
        }

        let all = store.find_by_key_prefix("batch-record-").await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(store.find_by_key_prefix("batch-record-b").await.unwrap().len(), 1);
        assert!(store.find_by_key_prefix("other-").await.unwrap().is_empty());

        assert!(store.delete(&key("b")).await.unwrap());
        assert!(!store.delete(&key("b")).await.unwrap());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn save_keeps_the_lease() {
        let store = InMemoryRecordStore::new();
        let held = found(store.lock(&key("a"), LockMode::Wait, Utc::now()).await.unwrap());
        store.save(&held.record).await.unwrap();
        assert!(store.is_locked(&key("a")));
    }
}
