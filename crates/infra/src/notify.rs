//! Lifecycle notifications (start, resume, finish).
//!
//! Notifications are side information; delivery failures are logged by the caller and
//! never affect the job.

use std::sync::Mutex;

use tracing::info;

use chunkline_core::{Action, BatchKey};

/// A rendered notification ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub key: BatchKey,
    pub action: Action,
    pub channel: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Destination for notifications.
pub trait NotificationSink: Send + Sync + 'static {
    fn deliver(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            key = %notification.key,
            action = %notification.action,
            channel = notification.channel.as_deref().unwrap_or("-"),
            "{}",
            notification.message
        );
        Ok(())
    }
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryNotificationSink {
    inner: Mutex<Vec<Notification>>,
}

impl InMemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Notification> {
        self.inner.lock().map(|n| n.clone()).unwrap_or_default()
    }

    pub fn for_action(&self, action: Action) -> Vec<Notification> {
        self.all().into_iter().filter(|n| n.action == action).collect()
    }
}

impl NotificationSink for InMemoryNotificationSink {
    fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.inner
            .lock()
            .map_err(|_| NotifyError("sink lock poisoned".to_string()))?
            .push(notification.clone());
        Ok(())
    }
}

/// Fill a template.
///
/// Placeholders: `{0}` / `{key}` job key, `{1}` / `{cursor}` current cursor (empty when
/// none), `{2}` / `{minutes}` whole minutes since the run started.
pub fn render_template(
    template: &str,
    key: &BatchKey,
    cursor: Option<&serde_json::Value>,
    elapsed_minutes: i64,
) -> String {
    let cursor = match cursor {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    let minutes = elapsed_minutes.to_string();

    template
        .replace("{0}", key.suffix())
        .replace("{key}", key.suffix())
        .replace("{1}", &cursor)
        .replace("{cursor}", &cursor)
        .replace("{2}", &minutes)
        .replace("{minutes}", &minutes)
}
