//! Built-in demo handler, registered as `range` by the binary.
//!
//! Walks the integers `0..count` (`count` query argument, default 1000) and logs each
//! one. `fail_on` makes that item fail once per process, to exercise retries.

use std::collections::HashSet;
use std::sync::Mutex;

use chunkline_core::HandlerError;
use chunkline_infra::{BatchContext, BatchHandler};
use tracing::debug;

pub const RANGE_HANDLER: &str = "range";

const DEFAULT_COUNT: u64 = 1000;

#[derive(Debug, Default)]
pub struct RangeHandler {
    failed: Mutex<HashSet<u64>>,
}

impl RangeHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

fn numeric_argument(ctx: &BatchContext, name: &str) -> Result<Option<u64>, HandlerError> {
    ctx.argument(name)
        .map(|raw| {
            raw.parse()
                .map_err(|_| HandlerError::no_retry(format!("{name} must be an integer, got {raw:?}")))
        })
        .transpose()
}

#[async_trait::async_trait]
impl BatchHandler for RangeHandler {
    type Item = u64;

    async fn get(
        &self,
        ctx: &BatchContext,
        cursor: Option<&u64>,
        chunk_size: u64,
    ) -> Result<Vec<u64>, HandlerError> {
        let count = numeric_argument(ctx, "count")?.unwrap_or(DEFAULT_COUNT);
        let from = cursor.map_or(0, |c| c + 1);
        let to = from.saturating_add(chunk_size).min(count);
        Ok((from..to).collect())
    }

    async fn execute(&self, ctx: &BatchContext, item: &u64) -> Result<(), HandlerError> {
        if numeric_argument(ctx, "fail_on")? == Some(*item) {
            let first_time = self
                .failed
                .lock()
                .map(|mut failed| failed.insert(*item))
                .unwrap_or(false);
            if first_time {
                return Err(HandlerError::new(format!("item {item} failed on purpose")));
            }
        }
        debug!(key = %ctx.key, item, "range item processed");
        Ok(())
    }
}
