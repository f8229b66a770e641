use serde::Deserialize;
use serde_json::{Value, json};

use chunkline_core::{BatchConfig, BatchKey};
use chunkline_infra::ResumeOutcome;

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct StartBatchRequest {
    pub key: String,
    #[serde(default)]
    pub config: BatchConfig,
    /// Discard progress and begin a new run.
    #[serde(default)]
    pub restart: bool,
    /// On reset, carry the previous run's count over as the expected count.
    #[serde(default)]
    pub use_last_count_as_expected: bool,
}

// -------------------------
// Mapping helpers
// -------------------------

pub fn parse_key(raw: &str) -> Result<BatchKey, axum::response::Response> {
    BatchKey::new(raw).map_err(errors::batch_error_to_response)
}

pub fn outcome_to_json(outcome: &ResumeOutcome) -> Value {
    match outcome {
        ResumeOutcome::Absent => json!({ "outcome": "absent" }),
        ResumeOutcome::Skipped => json!({ "outcome": "skipped" }),
        ResumeOutcome::AlreadyFinished => json!({ "outcome": "already_finished" }),
        ResumeOutcome::Advanced {
            processed,
            next_run_at,
        } => json!({
            "outcome": "advanced",
            "processed_count": processed,
            "next_run_at": next_run_at.to_rfc3339(),
        }),
        ResumeOutcome::Finished { processed } => json!({
            "outcome": "finished",
            "processed_count": processed,
        }),
    }
}
