use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use chunkline_core::record::{saturating_add, to_chrono};
use chunkline_core::{Clock, SystemClock};

use super::r#trait::{QueueError, QueueMessage, TaskQueue};

/// A message waiting for its delivery time.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledMessage {
    pub id: String,
    pub deliver_at: DateTime<Utc>,
    pub message: QueueMessage,
    seq: u64,
}

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    pending: HashMap<String, ScheduledMessage>,
}

/// In-memory delayed queue for tests/dev.
///
/// Delivery times come from the injected clock, so tests can step time forward and
/// poll deterministically.
pub struct InMemoryTaskQueue {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl std::fmt::Debug for InMemoryTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTaskQueue")
            .field("pending", &self.len())
            .finish()
    }
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Command("queue state lock poisoned".to_string()))
    }

    /// Pending messages ordered by delivery time.
    pub fn scheduled(&self) -> Vec<ScheduledMessage> {
        let Ok(state) = self.state() else {
            return Vec::new();
        };
        let mut all: Vec<_> = state.pending.values().cloned().collect();
        all.sort_by_key(|m| (m.deliver_at, m.seq));
        all
    }

    /// Pending message carrying the dedupe key, if any.
    pub fn pending(&self, dedupe_key: &str) -> Option<ScheduledMessage> {
        self.state().ok()?.pending.get(dedupe_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().map(|s| s.pending.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest pending delivery time.
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.scheduled().first().map(|m| m.deliver_at)
    }
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(
        &self,
        message: QueueMessage,
        delay: Duration,
        dedupe_key: Option<&str>,
    ) -> Result<(), QueueError> {
        let deliver_at = saturating_add(self.clock.now(), to_chrono(delay));
        let mut state = self.state()?;
        let seq = state.next_seq;
        state.next_seq += 1;

        let id = dedupe_key
            .map(str::to_string)
            .unwrap_or_else(|| format!("msg-{seq}"));
        state.pending.insert(
            id.clone(),
            ScheduledMessage {
                id,
                deliver_at,
                message,
                seq,
            },
        );
        Ok(())
    }

    async fn poll_due(&self, max: usize) -> Result<Vec<QueueMessage>, QueueError> {
        let now = self.clock.now();
        let mut state = self.state()?;

        let mut due: Vec<_> = state
            .pending
            .values()
            .filter(|m| m.deliver_at <= now)
            .map(|m| (m.deliver_at, m.seq, m.id.clone()))
            .collect();
        due.sort();

        Ok(due
            .into_iter()
            .take(max)
            .filter_map(|(_, _, id)| state.pending.remove(&id))
            .map(|m| m.message)
            .collect())
    }
}
