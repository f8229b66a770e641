//! Delayed task queue boundary.
//!
//! The orchestrator never sleeps between chunks; it schedules its own continuation as a
//! delayed message and a worker picks it up when due.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod r#trait;

pub use in_memory::{InMemoryTaskQueue, ScheduledMessage};
#[cfg(feature = "redis")]
pub use redis::RedisTaskQueue;
pub use r#trait::{
    BatchTask, QueueError, QueueMessage, TaskQueue, CLEAN_DESTINATION, RESUME_DESTINATION,
};
