//! Strongly-typed identifiers for batch jobs and lock leases.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BatchError;

/// Prefix shared by every persisted batch record key.
pub const RECORD_KEY_PREFIX: &str = "batch-record-";

/// Key suffix identifying one logical batch job.
///
/// The persisted key is `RECORD_KEY_PREFIX + suffix` (see [`BatchKey::record_key`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchKey(String);

impl BatchKey {
    /// Build a key from a suffix, rejecting empty or whitespace-only values.
    pub fn new(suffix: impl Into<String>) -> Result<Self, BatchError> {
        let suffix = suffix.into();
        if suffix.trim().is_empty() {
            return Err(BatchError::invalid_key("key suffix must not be empty"));
        }
        if suffix.contains('/') {
            return Err(BatchError::invalid_key(format!(
                "key suffix must not contain '/': {suffix}"
            )));
        }
        Ok(Self(suffix))
    }

    /// Recover the suffix from a full store key (`batch-record-<suffix>`).
    pub fn from_record_key(record_key: &str) -> Result<Self, BatchError> {
        match record_key.strip_prefix(RECORD_KEY_PREFIX) {
            Some(suffix) => Self::new(suffix),
            None => Err(BatchError::invalid_key(format!(
                "not a batch record key: {record_key}"
            ))),
        }
    }

    pub fn suffix(&self) -> &str {
        &self.0
    }

    /// Full key under which the record is persisted.
    pub fn record_key(&self) -> String {
        format!("{RECORD_KEY_PREFIX}{}", self.0)
    }
}

impl core::fmt::Display for BatchKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BatchKey {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Token proving ownership of a record lock.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    /// Create a new token.
    ///
    /// Uses UUIDv7 (time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}
