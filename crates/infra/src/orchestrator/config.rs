use std::time::Duration;

use chunkline_core::{BatchError, BatchResult, RECORD_KEY_PREFIX};

use crate::store::StoreConfig;

/// How much longer than one chunk a blocking lock wait lasts.
pub const LOCK_WAIT_SLACK: Duration = Duration::from_secs(60);

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound for one chunk (fetch plus item processing).
    pub chunk_timeout: Duration,
    /// Lock lease; must outlive the chunk timeout.
    pub lock_lease: Duration,
    /// Maximum wait for the blocking lock used by `start` and `cancel`; must cover a
    /// whole chunk so a running chunk cannot starve them.
    pub lock_wait: Duration,
    /// Store key prefix scanned by the sweep.
    pub key_prefix: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            chunk_timeout: Duration::from_secs(60 * 60),
            lock_lease: Duration::from_secs(2 * 60 * 60),
            lock_wait: Duration::from_secs(60 * 60) + LOCK_WAIT_SLACK,
            key_prefix: RECORD_KEY_PREFIX.to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Also raises `lock_wait` to cover the new timeout.
    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = timeout;
        self.lock_wait = self.lock_wait.max(timeout.saturating_add(LOCK_WAIT_SLACK));
        self
    }

    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn validate(&self) -> BatchResult<()> {
        if self.chunk_timeout.is_zero() {
            return Err(BatchError::validation("chunk_timeout must be positive"));
        }
        if self.lock_lease <= self.chunk_timeout {
            return Err(BatchError::validation(format!(
                "lock_lease ({:?}) must exceed chunk_timeout ({:?})",
                self.lock_lease, self.chunk_timeout
            )));
        }
        if self.lock_wait < self.chunk_timeout {
            return Err(BatchError::validation(format!(
                "lock_wait ({:?}) must cover chunk_timeout ({:?})",
                self.lock_wait, self.chunk_timeout
            )));
        }
        Ok(())
    }

    /// Store settings matching this configuration's locking.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::default()
            .with_lease_ttl(self.lock_lease)
            .with_lock_wait(self.lock_wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_lease_outlives_chunk_timeout() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store_config().lease_ttl, Duration::from_secs(7200));
        assert_eq!(config.key_prefix, "batch-record-");
    }

    #[test]
    fn lease_shorter_than_chunk_is_rejected() {
        let config = OrchestratorConfig::default()
            .with_chunk_timeout(Duration::from_secs(600))
            .with_lock_lease(Duration::from_secs(300));
        assert!(matches!(config.validate(), Err(BatchError::Validation(_))));
    }

    #[test]
    fn lock_wait_covers_a_whole_chunk() {
        let config = OrchestratorConfig::default();
        assert!(config.lock_wait > config.chunk_timeout);
        assert_eq!(config.store_config().lock_wait, config.lock_wait);

        let longer = OrchestratorConfig::default()
            .with_chunk_timeout(Duration::from_secs(3 * 60 * 60))
            .with_lock_lease(Duration::from_secs(6 * 60 * 60));
        assert_eq!(longer.lock_wait, Duration::from_secs(3 * 60 * 60) + LOCK_WAIT_SLACK);
        assert!(longer.validate().is_ok());

        let starved = OrchestratorConfig::default().with_lock_wait(Duration::from_secs(30));
        assert!(matches!(starved.validate(), Err(BatchError::Validation(_))));
    }
}
