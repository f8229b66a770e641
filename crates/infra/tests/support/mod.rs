#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use chunkline_core::{BatchKey, Clock, HandlerError, ManualClock};
use chunkline_infra::{
    BatchContext, BatchHandler, BatchOrchestrator, HandlerRegistry, InMemoryNotificationSink,
    InMemoryRecordStore, InMemoryTaskQueue, OrchestratorConfig, TaskQueue,
};

pub type TestOrchestrator = BatchOrchestrator<Arc<InMemoryRecordStore>, Arc<InMemoryTaskQueue>>;

#[derive(Debug, Default)]
pub struct Calls {
    pub start: AtomicUsize,
    pub resume: AtomicUsize,
    pub get: AtomicUsize,
    pub execute: AtomicUsize,
    pub finish: AtomicUsize,
}

impl Calls {
    pub fn start(&self) -> usize {
        self.start.load(Ordering::SeqCst)
    }
    pub fn resume(&self) -> usize {
        self.resume.load(Ordering::SeqCst)
    }
    pub fn get(&self) -> usize {
        self.get.load(Ordering::SeqCst)
    }
    pub fn execute(&self) -> usize {
        self.execute.load(Ordering::SeqCst)
    }
    pub fn finish(&self) -> usize {
        self.finish.load(Ordering::SeqCst)
    }
}

/// Serves the integers `0..total` in order.
pub struct Counting {
    pub total: u64,
    pub calls: Arc<Calls>,
    /// Manual clock advanced by `per_item` for every executed item.
    pub clock: Option<(Arc<ManualClock>, ChronoDuration)>,
    /// Executing this item fails with the given error.
    pub fail_on: Option<(u64, HandlerError)>,
    /// Real time spent in `get`.
    pub get_delay: Duration,
    /// Real time spent per executed item.
    pub item_delay: Duration,
}

impl Counting {
    pub fn new(total: u64) -> (Self, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        (
            Self {
                total,
                calls: calls.clone(),
                clock: None,
                fail_on: None,
                get_delay: Duration::ZERO,
                item_delay: Duration::ZERO,
            },
            calls,
        )
    }
}

#[async_trait::async_trait]
impl BatchHandler for Counting {
    type Item = u64;

    async fn start(&self, _ctx: &BatchContext) -> Result<(), HandlerError> {
        self.calls.start.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self, _ctx: &BatchContext) -> Result<(), HandlerError> {
        self.calls.resume.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(
        &self,
        _ctx: &BatchContext,
        cursor: Option<&u64>,
        chunk_size: u64,
    ) -> Result<Vec<u64>, HandlerError> {
        self.calls.get.fetch_add(1, Ordering::SeqCst);
        if !self.get_delay.is_zero() {
            tokio::time::sleep(self.get_delay).await;
        }
        let from = cursor.map_or(0, |c| c + 1);
        let to = (from + chunk_size).min(self.total);
        Ok((from..to).collect())
    }

    async fn execute(&self, _ctx: &BatchContext, item: &u64) -> Result<(), HandlerError> {
        if let Some((failing, err)) = &self.fail_on {
            if failing == item {
                return Err(err.clone());
            }
        }
        if !self.item_delay.is_zero() {
            tokio::time::sleep(self.item_delay).await;
        }
        if let Some((clock, per_item)) = &self.clock {
            clock.advance(*per_item);
        }
        self.calls.execute.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn finish(&self, _ctx: &BatchContext) -> Result<(), HandlerError> {
        self.calls.finish.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryRecordStore>,
    pub queue: Arc<InMemoryTaskQueue>,
    pub notes: Arc<InMemoryNotificationSink>,
    pub orchestrator: TestOrchestrator,
}

impl Harness {
    pub fn new(clock: Arc<ManualClock>, handlers: HandlerRegistry) -> Self {
        Self::with_config(clock, handlers, OrchestratorConfig::default())
    }

    pub fn with_config(
        clock: Arc<ManualClock>,
        handlers: HandlerRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        let store = Arc::new(InMemoryRecordStore::with_config(config.store_config()));
        let queue = Arc::new(InMemoryTaskQueue::with_clock(clock.clone()));
        let notes = Arc::new(InMemoryNotificationSink::new());
        let orchestrator = BatchOrchestrator::new(store.clone(), queue.clone(), handlers)
            .with_clock(clock.clone())
            .with_notifier(notes.clone())
            .with_config(config);
        Self {
            clock,
            store,
            queue,
            notes,
            orchestrator,
        }
    }

    /// Step time forward a second, then run one chunk.
    pub async fn tick_resume(
        &self,
        key: &BatchKey,
    ) -> chunkline_core::BatchResult<chunkline_infra::ResumeOutcome> {
        self.clock.advance(ChronoDuration::seconds(1));
        self.orchestrator.resume(key).await
    }

    /// Deliver queued tasks in time order until the queue is empty or `max_steps` ran.
    pub async fn pump(&self, max_steps: usize) -> usize {
        let mut steps = 0;
        while steps < max_steps {
            let Some(due) = self.queue.next_due_at() else {
                break;
            };
            if due > self.clock.now() {
                self.clock.set(due);
            }
            self.clock.advance(ChronoDuration::milliseconds(1));
            for message in self.queue.poll_due(16).await.unwrap() {
                let task = chunkline_infra::BatchTask::from_message(&message).unwrap();
                let _ = self.orchestrator.handle_task(&task).await;
                steps += 1;
            }
        }
        steps
    }
}

pub fn key(suffix: &str) -> BatchKey {
    BatchKey::new(suffix).unwrap()
}
