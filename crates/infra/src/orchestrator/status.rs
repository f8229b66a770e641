use chrono::{DateTime, Utc};
use serde::Serialize;

use chunkline_core::{BatchKey, BatchRecord, BatchState};

/// Result of one `resume` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// No record for the key.
    Absent,
    /// Another worker holds the lock; this trigger was dropped.
    Skipped,
    /// The job had already finished; nothing ran.
    AlreadyFinished,
    /// One chunk ran; the next one is scheduled.
    Advanced {
        processed: u64,
        next_run_at: DateTime<Utc>,
    },
    /// The fetch came back empty and the job finished.
    Finished { processed: u64 },
}

/// What a sweep scheduled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub resumes_scheduled: usize,
    pub cleanups_scheduled: usize,
}

/// Read-only view of a record with its derived values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchStatus {
    pub key: BatchKey,
    pub state: BatchState,
    pub handler_name: Option<String>,
    pub item_type: Option<String>,
    pub chunk_size: u64,
    pub expected_count: Option<u64>,
    pub processed_count: u64,
    pub cursor: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub kept_until: DateTime<Utc>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_chunk_started_at: Option<DateTime<Utc>>,
    pub last_chunk_finished_at: Option<DateTime<Utc>>,
}

impl BatchStatus {
    pub fn from_record(record: &BatchRecord, now: DateTime<Utc>) -> Self {
        Self {
            key: record.key().clone(),
            state: record.state(now),
            handler_name: record.handler_name().map(str::to_string),
            item_type: record.item_type().map(str::to_string),
            chunk_size: record.chunk_size(),
            expected_count: record.expected_count(),
            processed_count: record.processed_count(),
            cursor: record.cursor().cloned(),
            started_at: record.started_at(),
            finished_at: record.finished_at(),
            cancelled_at: record.cancelled_at(),
            expires_at: record.expires_at(),
            kept_until: record.kept_until(),
            next_run_at: record.next_run_at(now),
            last_chunk_started_at: record.last_chunk_started_at(),
            last_chunk_finished_at: record.last_chunk_finished_at(),
        }
    }
}
