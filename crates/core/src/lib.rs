//! `chunkline-core`: batch job building blocks.
//!
//! This crate contains **pure** batch primitives (no I/O): the record describing one
//! job's configuration and progress, the incoming configuration, the error taxonomy,
//! and the time source.

pub mod action;
pub mod clock;
pub mod config;
pub mod duration_ms;
pub mod error;
pub mod id;
pub mod record;

pub use action::Action;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BatchConfig, MAX_DURATION};
pub use error::{BatchError, BatchResult, HandlerError, RetryHint};
pub use id::{BatchKey, LeaseToken, RECORD_KEY_PREFIX};
pub use record::{BatchRecord, BatchState, saturating_add};
