//! Batch error model.
//!
//! Failures fall into four groups that drive the orchestrator's retry policy:
//! - **Expired**: deadline passed or job cancelled. Terminal, never rescheduled.
//! - **Handler failure**: anything a handler operation returned.
//! - **Retriable**: a failure carrying a [`RetryHint`] other than `Never`.
//! - **Non-retriable**: a failure explicitly hinting `Never`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::action::Action;

/// Result type used across the batch layer.
pub type BatchResult<T> = Result<T, BatchError>;

/// Retry semantics a failure may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryHint {
    /// Retry with the orchestrator's default (paced) delay.
    #[default]
    Unspecified,
    /// Retry after the given delay.
    After(Duration),
    /// Do not reschedule automatically.
    Never,
}

/// Failure raised by a handler operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    retry: RetryHint,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry: RetryHint::Unspecified,
        }
    }

    /// Failure that suggests retrying after `delay`.
    pub fn retry_after(message: impl Into<String>, delay: Duration) -> Self {
        Self {
            message: message.into(),
            retry: RetryHint::After(delay),
        }
    }

    /// Failure that must not be retried automatically.
    pub fn no_retry(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry: RetryHint::Never,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn retry(&self) -> RetryHint {
        self.retry
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::no_retry(format!("item (de)serialization failed: {err}"))
    }
}

/// Batch-level error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BatchError {
    /// The key suffix is malformed.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A request or configuration value failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No record exists for the key.
    #[error("batch not found: {0}")]
    NotFound(String),

    /// Deadline passed or the job was cancelled.
    #[error("batch {key} expired at {expires_at}")]
    Expired {
        key: String,
        expires_at: DateTime<Utc>,
    },

    /// A handler operation failed.
    #[error("batch {key}: {action} failed: {source}")]
    Handler {
        key: String,
        action: Action,
        #[source]
        source: HandlerError,
    },

    /// A chunk did not complete within the configured timeout.
    #[error("batch {key}: chunk exceeded {timeout:?}")]
    ChunkTimeout { key: String, timeout: Duration },

    /// No handler is registered under the name.
    #[error("no handler registered as '{0}'")]
    UnknownHandler(String),

    /// The record's item type tag does not match the resolved handler.
    #[error("batch {key}: item type mismatch (record {recorded}, handler {handler})")]
    ItemTypeMismatch {
        key: String,
        recorded: String,
        handler: String,
    },

    /// A cursor or queue payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record persistence failed.
    #[error("store error: {0}")]
    Store(String),

    /// Scheduling a follow-up message failed.
    #[error("queue error: {0}")]
    Queue(String),
}

impl BatchError {
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    pub fn handler(key: impl Into<String>, action: Action, source: HandlerError) -> Self {
        Self::Handler {
            key: key.into(),
            action,
            source,
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired { .. })
    }

    /// Retry semantics, for the failures that carry them.
    ///
    /// `None` means the failure does not signal retry semantics at all and is
    /// treated as retriable with the default delay.
    pub fn retry_hint(&self) -> Option<RetryHint> {
        match self {
            Self::Handler { source, .. } => Some(source.retry()),
            Self::ChunkTimeout { .. } => Some(RetryHint::Unspecified),
            Self::ItemTypeMismatch { .. } => Some(RetryHint::Never),
            _ => None,
        }
    }

    /// Explicitly marked "do not auto-retry".
    pub fn is_non_retriable(&self) -> bool {
        self.retry_hint() == Some(RetryHint::Never)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_explicit_never_is_non_retriable() {
        let plain = BatchError::handler("k", Action::Execute, HandlerError::new("boom"));
        let never = BatchError::handler("k", Action::Execute, HandlerError::no_retry("bad row"));
        let later = BatchError::handler(
            "k",
            Action::Get,
            HandlerError::retry_after("throttled", Duration::from_secs(30)),
        );

        assert!(!plain.is_non_retriable());
        assert!(never.is_non_retriable());
        assert!(!later.is_non_retriable());
        assert_eq!(
            later.retry_hint(),
            Some(RetryHint::After(Duration::from_secs(30)))
        );
    }

    #[test]
    fn expired_carries_no_retry_capability() {
        let err = BatchError::Expired {
            key: "k".into(),
            expires_at: Utc::now(),
        };
        assert!(err.is_expired());
        assert_eq!(err.retry_hint(), None);
        assert!(!err.is_non_retriable());
    }
}
