use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use chunkline_core::{BatchError, BatchKey};

/// Destination served by [`BatchTask::Resume`].
pub const RESUME_DESTINATION: &str = "batch.resume";
/// Destination served by [`BatchTask::Clean`].
pub const CLEAN_DESTINATION: &str = "batch.clean";

/// A message as it travels through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub destination: String,
    pub payload: serde_json::Value,
}

impl QueueMessage {
    pub fn new(destination: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            destination: destination.into(),
            payload,
        }
    }
}

/// Task queue error.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),
    #[error("queue command error: {0}")]
    Command(String),
    #[error("queue serialization error: {0}")]
    Serialization(String),
    #[error("no consumer for destination '{0}'")]
    UnknownDestination(String),
}

impl From<QueueError> for BatchError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Serialization(msg) => BatchError::Serialization(msg),
            other => BatchError::Queue(other.to_string()),
        }
    }
}

/// Delayed-delivery task queue.
///
/// A message enqueued with a dedupe key replaces any still-pending message carrying the
/// same key; its delivery time is the new one.
#[async_trait::async_trait]
pub trait TaskQueue: Send + Sync {
    /// Deliver `message` no earlier than `delay` from now.
    async fn enqueue(
        &self,
        message: QueueMessage,
        delay: Duration,
        dedupe_key: Option<&str>,
    ) -> Result<(), QueueError>;

    /// Claim up to `max` messages whose delivery time has come, earliest first.
    ///
    /// A claimed message is removed from the queue.
    async fn poll_due(&self, max: usize) -> Result<Vec<QueueMessage>, QueueError>;
}

#[async_trait::async_trait]
impl<Q> TaskQueue for Arc<Q>
where
    Q: TaskQueue + ?Sized,
{
    async fn enqueue(
        &self,
        message: QueueMessage,
        delay: Duration,
        dedupe_key: Option<&str>,
    ) -> Result<(), QueueError> {
        (**self).enqueue(message, delay, dedupe_key).await
    }

    async fn poll_due(&self, max: usize) -> Result<Vec<QueueMessage>, QueueError> {
        (**self).poll_due(max).await
    }
}

/// Work items the orchestrator schedules for itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum BatchTask {
    /// Run the next chunk of a job.
    Resume { key: BatchKey },
    /// Delete a job's record if it is past retention.
    Clean { key: BatchKey },
}

impl BatchTask {
    pub fn key(&self) -> &BatchKey {
        match self {
            Self::Resume { key } | Self::Clean { key } => key,
        }
    }

    pub fn destination(&self) -> &'static str {
        match self {
            Self::Resume { .. } => RESUME_DESTINATION,
            Self::Clean { .. } => CLEAN_DESTINATION,
        }
    }

    /// One pending message per task kind and key.
    pub fn dedupe_key(&self) -> String {
        match self {
            Self::Resume { key } => format!("resume:{key}"),
            Self::Clean { key } => format!("clean:{key}"),
        }
    }

    pub fn to_message(&self) -> Result<QueueMessage, QueueError> {
        let payload =
            serde_json::to_value(self).map_err(|e| QueueError::Serialization(e.to_string()))?;
        Ok(QueueMessage::new(self.destination(), payload))
    }

    pub fn from_message(message: &QueueMessage) -> Result<Self, QueueError> {
        if message.destination != RESUME_DESTINATION && message.destination != CLEAN_DESTINATION {
            return Err(QueueError::UnknownDestination(message.destination.clone()));
        }
        let task: Self = serde_json::from_value(message.payload.clone())
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        if task.destination() != message.destination {
            return Err(QueueError::Serialization(format!(
                "payload for {} delivered to {}",
                task.destination(),
                message.destination
            )));
        }
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_message_shape() {
        let task = BatchTask::Resume {
            key: BatchKey::new("reindex").unwrap(),
        };
        let message = task.to_message().unwrap();
        assert_eq!(message.destination, "batch.resume");
        assert_eq!(
            message.payload,
            serde_json::json!({ "task": "resume", "key": "reindex" })
        );
        assert_eq!(BatchTask::from_message(&message).unwrap(), task);
        assert_eq!(task.dedupe_key(), "resume:reindex");
    }

    #[test]
    fn mismatched_destination_is_rejected() {
        let mut message = BatchTask::Clean {
            key: BatchKey::new("reindex").unwrap(),
        }
        .to_message()
        .unwrap();
        message.destination = RESUME_DESTINATION.to_string();
        assert!(matches!(
            BatchTask::from_message(&message),
            Err(QueueError::Serialization(_))
        ));

        message.destination = "mail.send".to_string();
        assert!(matches!(
            BatchTask::from_message(&message),
            Err(QueueError::UnknownDestination(_))
        ));
    }
}
