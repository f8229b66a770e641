//! Redis-backed delayed task queue.
//!
//! ## Layout
//!
//! - **Schedule** (`<prefix>:due`): sorted set, member = message id, score = delivery
//!   time in epoch milliseconds.
//! - **Payloads** (`<prefix>:payloads`): hash, message id → JSON `QueueMessage`.
//!
//! The message id is the dedupe key when one is given, so re-enqueueing under the same
//! key overwrites both the payload and the score. Claiming runs as a Lua script so that
//! concurrent workers never receive the same message.

use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;
use tracing::instrument;
use uuid::Uuid;

use chunkline_core::record::{saturating_add, to_chrono};
use chunkline_core::{Clock, SystemClock};

use super::r#trait::{QueueError, QueueMessage, TaskQueue};

/// Default key prefix.
const DEFAULT_KEY_PREFIX: &str = "chunkline:queue";

const CLAIM_DUE: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
local out = {}
for _, id in ipairs(ids) do
    redis.call('ZREM', KEYS[1], id)
    local payload = redis.call('HGET', KEYS[2], id)
    redis.call('HDEL', KEYS[2], id)
    if payload then
        table.insert(out, payload)
    end
end
return out
"#;

#[derive(Clone)]
pub struct RedisTaskQueue {
    client: Arc<redis::Client>,
    clock: Arc<dyn Clock>,
    due_key: String,
    payload_key: String,
}

impl std::fmt::Debug for RedisTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTaskQueue")
            .field("due_key", &self.due_key)
            .field("payload_key", &self.payload_key)
            .finish()
    }
}

impl RedisTaskQueue {
    /// Create a queue on `redis_url` (e.g. `redis://localhost:6379`).
    pub fn new(redis_url: impl AsRef<str>, key_prefix: Option<&str>) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let prefix = key_prefix.unwrap_or(DEFAULT_KEY_PREFIX);

        Ok(Self {
            client: Arc::new(client),
            clock: Arc::new(SystemClock),
            due_key: format!("{prefix}:due"),
            payload_key: format!("{prefix}:payloads"),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))
    }

    /// Number of pending messages.
    pub async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        conn.zcard(&self.due_key)
            .await
            .map_err(|e| QueueError::Command(e.to_string()))
    }
}

#[async_trait::async_trait]
impl TaskQueue for RedisTaskQueue {
    #[instrument(
        skip(self, message),
        fields(destination = %message.destination, dedupe_key = ?dedupe_key),
        err
    )]
    async fn enqueue(
        &self,
        message: QueueMessage,
        delay: Duration,
        dedupe_key: Option<&str>,
    ) -> Result<(), QueueError> {
        let payload =
            serde_json::to_string(&message).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let id = dedupe_key
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let deliver_at_ms =
            saturating_add(self.clock.now(), to_chrono(delay)).timestamp_millis();

        let mut conn = self.connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .hset(&self.payload_key, &id, payload)
            .ignore()
            .zadd(&self.due_key, &id, deliver_at_ms)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn poll_due(&self, max: usize) -> Result<Vec<QueueMessage>, QueueError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let now_ms = self.clock.now().timestamp_millis();

        let mut conn = self.connection().await?;
        let payloads: Vec<String> = redis::Script::new(CLAIM_DUE)
            .key(&self.due_key)
            .key(&self.payload_key)
            .arg(now_ms)
            .arg(max)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(e.to_string()))?;

        payloads
            .iter()
            .map(|p| {
                serde_json::from_str(p).map_err(|e| QueueError::Serialization(e.to_string()))
            })
            .collect()
    }
}
