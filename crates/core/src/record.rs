//! Batch record: configuration and progress of one batch job.
//!
//! The record is a plain value. Every derived value (expiry, cleanup, pacing, next run)
//! is recomputed from the stored fields and an explicit `now`; nothing is cached and
//! reads never mutate.
//!
//! ## Lifecycle
//!
//! 1. Created (empty) on the first `start` for a key.
//! 2. Mutated once per chunk by the orchestrator ([`BatchRecord::advance`],
//!    [`BatchRecord::record_chunk`], [`BatchRecord::mark_finished`]).
//! 3. Deleted by the sweep once [`BatchRecord::should_be_cleaned`] holds.
//!
//! ## Logical state
//!
//! Exactly one [`BatchState`] describes a stored record at any read. Cancellation and
//! expiry are not stored separately: cancelling sets `cancelled_at`, which moves
//! [`BatchRecord::expires_at`] to that instant.

use std::collections::BTreeMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::config::BatchConfig;
use crate::id::BatchKey;

pub const DEFAULT_CHUNK_SIZE: u64 = 10_000;
pub const DEFAULT_TARGET_DURATION: StdDuration = StdDuration::from_secs(12 * 60 * 60);
pub const DEFAULT_BASE_DELAY: StdDuration = StdDuration::from_secs(2);
/// Default deadline is this many target durations.
pub const DEADLINE_FACTOR: u32 = 3;
/// Default retention is this many deadlines.
pub const RETENTION_FACTOR: u32 = 5;

/// Logical state of a stored record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Running,
    Finished,
    Cancelled,
    Expired,
}

/// One batch job's configuration and progress.
///
/// `T` is the cursor/item type. Stores persist `BatchRecord<serde_json::Value>`;
/// [`BatchRecord::cursor_as`] recovers a typed cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord<T = serde_json::Value> {
    key: BatchKey,
    item_type: Option<String>,

    handler_name: Option<String>,
    chunk_size: Option<u64>,
    expected_count: Option<u64>,
    #[serde(with = "crate::duration_ms::option")]
    target_duration: Option<StdDuration>,
    #[serde(with = "crate::duration_ms::option")]
    base_delay: Option<StdDuration>,
    #[serde(with = "crate::duration_ms::option")]
    deadline: Option<StdDuration>,
    #[serde(with = "crate::duration_ms::option")]
    retention: Option<StdDuration>,
    #[serde(default)]
    action_bindings: BTreeMap<Action, String>,
    #[serde(default)]
    notification_templates: BTreeMap<Action, String>,
    #[serde(default)]
    notification_channels: BTreeMap<Action, String>,
    #[serde(default)]
    query_arguments: BTreeMap<String, String>,

    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    cursor: Option<T>,
    processed_count: u64,
    last_chunk_started_at: Option<DateTime<Utc>>,
    last_chunk_finished_at: Option<DateTime<Utc>>,
}

impl<T> BatchRecord<T> {
    /// Create an empty record whose run starts at `now`.
    pub fn new(key: BatchKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            item_type: None,
            handler_name: None,
            chunk_size: None,
            expected_count: None,
            target_duration: None,
            base_delay: None,
            deadline: None,
            retention: None,
            action_bindings: BTreeMap::new(),
            notification_templates: BTreeMap::new(),
            notification_channels: BTreeMap::new(),
            query_arguments: BTreeMap::new(),
            started_at: now,
            finished_at: None,
            cancelled_at: None,
            cursor: None,
            processed_count: 0,
            last_chunk_started_at: None,
            last_chunk_finished_at: None,
        }
    }

    // ---- configuration -------------------------------------------------------------

    pub fn key(&self) -> &BatchKey {
        &self.key
    }

    /// Full store key (`batch-record-<suffix>`).
    pub fn record_key(&self) -> String {
        self.key.record_key()
    }

    /// Type tag of the cursor/items, set from the handler on start.
    pub fn item_type(&self) -> Option<&str> {
        self.item_type.as_deref()
    }

    pub fn handler_name(&self) -> Option<&str> {
        self.handler_name.as_deref()
    }

    /// Items fetched per chunk (default 10000, never below 1).
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE).max(1)
    }

    pub fn expected_count(&self) -> Option<u64> {
        self.expected_count
    }

    pub fn target_duration(&self) -> StdDuration {
        self.target_duration.unwrap_or(DEFAULT_TARGET_DURATION)
    }

    pub fn base_delay(&self) -> StdDuration {
        self.base_delay.unwrap_or(DEFAULT_BASE_DELAY)
    }

    /// Hard limit from `started_at` (default: three target durations).
    pub fn deadline(&self) -> StdDuration {
        self.deadline.unwrap_or_else(|| {
            self.target_duration()
                .checked_mul(DEADLINE_FACTOR)
                .unwrap_or(StdDuration::MAX)
        })
    }

    /// How long the record is kept after `started_at` (default: five deadlines).
    pub fn retention(&self) -> StdDuration {
        self.retention.unwrap_or_else(|| {
            self.deadline()
                .checked_mul(RETENTION_FACTOR)
                .unwrap_or(StdDuration::MAX)
        })
    }

    pub fn action_bindings(&self) -> &BTreeMap<Action, String> {
        &self.action_bindings
    }

    /// Handler serving `action`: its binding if any, else the job's handler.
    pub fn handler_for(&self, action: Action) -> Option<&str> {
        self.action_bindings
            .get(&action)
            .map(String::as_str)
            .or(self.handler_name.as_deref())
    }

    pub fn notification_template(&self, action: Action) -> Option<&str> {
        self.notification_templates.get(&action).map(String::as_str)
    }

    pub fn notification_channel(&self, action: Action) -> Option<&str> {
        self.notification_channels.get(&action).map(String::as_str)
    }

    pub fn query_arguments(&self) -> &BTreeMap<String, String> {
        &self.query_arguments
    }

    // ---- progress ------------------------------------------------------------------

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
    }

    pub fn cursor(&self) -> Option<&T> {
        self.cursor.as_ref()
    }

    pub fn processed_count(&self) -> u64 {
        self.processed_count
    }

    pub fn last_chunk_started_at(&self) -> Option<DateTime<Utc>> {
        self.last_chunk_started_at
    }

    pub fn last_chunk_finished_at(&self) -> Option<DateTime<Utc>> {
        self.last_chunk_finished_at
    }

    // ---- derived -------------------------------------------------------------------

    /// `finished_at` is set and strictly after `started_at`.
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some_and(|f| f > self.started_at)
    }

    /// Cancellation instant if cancelled, else `started_at + deadline`.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.cancelled_at
            .unwrap_or_else(|| saturating_add(self.started_at, to_chrono(self.deadline())))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    pub fn kept_until(&self) -> DateTime<Utc> {
        saturating_add(self.started_at, to_chrono(self.retention()))
    }

    pub fn should_be_cleaned(&self, now: DateTime<Utc>) -> bool {
        now > self.kept_until()
    }

    pub fn state(&self, now: DateTime<Utc>) -> BatchState {
        if self.is_finished() {
            BatchState::Finished
        } else if self.cancelled_at.is_some() && self.is_expired(now) {
            BatchState::Cancelled
        } else if self.is_expired(now) {
            BatchState::Expired
        } else {
            BatchState::Running
        }
    }

    /// Wall time of the most recent chunk (zero before the first chunk).
    pub fn last_chunk_duration(&self) -> Duration {
        match (self.last_chunk_started_at, self.last_chunk_finished_at) {
            (Some(started), Some(finished)) if finished > started => finished - started,
            _ => Duration::zero(),
        }
    }

    /// Delay before the next chunk.
    ///
    /// Spreads the remaining target time evenly over the remaining expected chunks, net
    /// of how long the last chunk took. Without an expected count this is `base_delay`.
    /// Once the chunk estimate drops to zero or below (the job over-ran its expected
    /// count) the remaining time is spread thinly at a tenth of a chunk share. A negative
    /// result means "run immediately".
    pub fn paced_delay(&self, now: DateTime<Utc>) -> Duration {
        let Some(expected) = self.expected_count else {
            return to_chrono(self.base_delay());
        };

        let chunk_size = self.chunk_size() as i128;
        let remaining_items = expected as i128 - self.processed_count as i128;
        let total_chunks = expected as i128 / chunk_size;
        let remaining_chunks = remaining_items / chunk_size;

        let elapsed = now - self.started_at;
        let time_left = to_chrono(self.target_duration()) - elapsed;

        let per_chunk_budget = if time_left < Duration::zero() {
            Duration::zero()
        } else if remaining_chunks <= 0 {
            divide(divide(time_left, total_chunks.max(1)), 10)
        } else {
            divide(time_left, remaining_chunks)
        };

        per_chunk_budget - self.last_chunk_duration()
    }

    /// When the next chunk should run.
    ///
    /// `None` until the first chunk has run, meaning "run immediately". This holds for
    /// finished and expired records too; callers that must not run those (the sweep)
    /// check [`Self::is_finished`] and [`Self::is_expired`] first.
    pub fn next_run_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.last_chunk_finished_at
            .map(|finished| saturating_add(finished, self.paced_delay(now)))
    }

    // ---- mutation ------------------------------------------------------------------

    /// Merge caller configuration; progress fields are never touched.
    pub fn apply_config(&mut self, config: &BatchConfig) {
        if let Some(name) = &config.handler_name {
            self.handler_name = Some(name.clone());
        }
        if let Some(size) = config.chunk_size {
            self.chunk_size = Some(size);
        }
        if let Some(expected) = config.expected_count {
            self.expected_count = Some(expected);
        }
        if let Some(target) = config.target_duration {
            self.target_duration = Some(target);
        }
        if let Some(delay) = config.base_delay {
            self.base_delay = Some(delay);
        }
        if let Some(deadline) = config.deadline {
            self.deadline = Some(deadline);
        }
        if let Some(retention) = config.retention {
            self.retention = Some(retention);
        }
        if let Some(bindings) = &config.action_bindings {
            self.action_bindings = bindings.clone();
        }
        if let Some(templates) = &config.notification_templates {
            self.notification_templates = templates.clone();
        }
        if let Some(channels) = &config.notification_channels {
            self.notification_channels = channels.clone();
        }
        if let Some(arguments) = &config.query_arguments {
            self.query_arguments = arguments.clone();
        }
    }

    pub fn set_item_type(&mut self, item_type: impl Into<String>) {
        self.item_type = Some(item_type.into());
    }

    /// Start a new run from scratch at `now`.
    ///
    /// Clears the lifecycle markers, chunk timings, cursor and count. With
    /// `keep_count_as_expected` the previous run's count becomes the expected count.
    pub fn reset(&mut self, keep_count_as_expected: bool, now: DateTime<Utc>) {
        if keep_count_as_expected {
            self.expected_count = Some(self.processed_count);
        }
        self.last_chunk_started_at = None;
        self.last_chunk_finished_at = None;
        self.cancelled_at = None;
        self.finished_at = None;
        self.cursor = None;
        self.started_at = now;
        self.processed_count = 0;
    }

    /// One item processed: it becomes the resume point.
    pub fn advance(&mut self, item: T) {
        self.cursor = Some(item);
        self.processed_count += 1;
    }

    pub fn record_chunk(&mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) {
        self.last_chunk_started_at = Some(started_at);
        self.last_chunk_finished_at = Some(finished_at);
    }

    pub fn mark_finished(&mut self, now: DateTime<Utc>) {
        self.finished_at = Some(now.max(self.started_at));
    }

    /// Stop future chunks; an in-flight chunk is not interrupted.
    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.cancelled_at = Some(now);
    }
}

impl BatchRecord<serde_json::Value> {
    /// Decode the cursor as `U`.
    pub fn cursor_as<U: DeserializeOwned>(&self) -> Result<Option<U>, serde_json::Error> {
        self.cursor
            .as_ref()
            .map(|c| serde_json::from_value(c.clone()))
            .transpose()
    }
}

/// Saturating conversion to a signed duration.
pub fn to_chrono(d: StdDuration) -> Duration {
    Duration::milliseconds(d.as_millis().min(i64::MAX as u128 / 2) as i64)
}

/// `at + by`, pinned to the representable range instead of overflowing.
pub fn saturating_add(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    at.checked_add_signed(by).unwrap_or(if by < Duration::zero() {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

fn divide(d: Duration, by: i128) -> Duration {
    if by <= 0 {
        return d;
    }
    Duration::milliseconds((d.num_milliseconds() as i128 / by) as i64)
}
