//! Infrastructure layer: record stores, task queues, handlers, the orchestrator and
//! its background workers.

pub mod handler;
pub mod notify;
pub mod orchestrator;
pub mod queue;
pub mod store;
pub mod workers;

pub use handler::{BatchContext, BatchHandler, DynBatchHandler, HandlerRegistry};
pub use notify::{
    InMemoryNotificationSink, Notification, NotificationSink, NotifyError, TracingNotificationSink,
};
pub use orchestrator::{BatchOrchestrator, BatchStatus, OrchestratorConfig, ResumeOutcome, SweepReport};
pub use queue::{BatchTask, InMemoryTaskQueue, QueueError, QueueMessage, TaskQueue};
pub use store::{InMemoryRecordStore, PostgresRecordStore, RecordStore, StoreConfig, StoreError};
pub use workers::{QueueWorker, SweepConfig, SweepScheduler, WorkerConfig, WorkerHandle};
