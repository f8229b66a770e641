use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::orchestrator::BatchOrchestrator;
use crate::queue::{BatchTask, TaskQueue};
use crate::store::RecordStore;

use super::{stopping, update, WorkerHandle};

/// Queue worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls when nothing is due.
    pub poll_interval: Duration,
    /// Messages claimed per poll.
    pub batch_size: usize,
    /// Tasks running at once.
    pub max_concurrent: usize,
    /// Name for logging.
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            batch_size: 16,
            max_concurrent: 4,
            name: "batch-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }
}

/// Queue worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub malformed_messages: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Claims due messages and hands them to the orchestrator.
#[derive(Debug)]
pub struct QueueWorker;

impl QueueWorker {
    /// Spawn the worker on the current tokio runtime.
    pub fn spawn<S, Q>(
        orchestrator: Arc<BatchOrchestrator<S, Q>>,
        config: WorkerConfig,
    ) -> WorkerHandle<WorkerStats>
    where
        S: RecordStore + 'static,
        Q: TaskQueue + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let join = tokio::spawn(worker_loop(orchestrator, config, shutdown_rx, stats.clone()));
        WorkerHandle::new(shutdown_tx, join, stats)
    }
}

async fn worker_loop<S, Q>(
    orchestrator: Arc<BatchOrchestrator<S, Q>>,
    config: WorkerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: Arc<Mutex<WorkerStats>>,
) where
    S: RecordStore + 'static,
    Q: TaskQueue + 'static,
{
    info!(worker = %config.name, "batch queue worker started");
    let started = Instant::now();
    let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
    let mut running = JoinSet::new();

    loop {
        if stopping(&shutdown_rx) {
            break;
        }
        update(&stats, |s| s.uptime_secs = started.elapsed().as_secs());
        while running.try_join_next().is_some() {}

        let free = slots.available_permits().min(config.batch_size);
        if free == 0 {
            tokio::select! {
                _ = running.join_next() => {}
                _ = shutdown_rx.changed() => {}
            }
            continue;
        }

        let messages = match orchestrator.queue().poll_due(free).await {
            Ok(messages) => messages,
            Err(err) => {
                error!(worker = %config.name, error = %err, "failed to poll batch queue");
                idle(&mut shutdown_rx, config.poll_interval).await;
                continue;
            }
        };

        if messages.is_empty() {
            idle(&mut shutdown_rx, config.poll_interval).await;
            continue;
        }

        for message in messages {
            let task = match BatchTask::from_message(&message) {
                Ok(task) => task,
                Err(err) => {
                    warn!(
                        worker = %config.name,
                        destination = %message.destination,
                        error = %err,
                        "dropping malformed batch message"
                    );
                    update(&stats, |s| s.malformed_messages += 1);
                    continue;
                }
            };

            let Ok(permit) = slots.clone().acquire_owned().await else {
                break;
            };
            update(&stats, |s| s.current_running += 1);

            let orchestrator = orchestrator.clone();
            let stats = stats.clone();
            let name = config.name.clone();
            running.spawn(async move {
                let result = orchestrator.handle_task(&task).await;
                drop(permit);
                let succeeded = result.is_ok();
                update(&stats, |s| {
                    s.current_running = s.current_running.saturating_sub(1);
                    s.tasks_processed += 1;
                    if succeeded {
                        s.tasks_succeeded += 1;
                    } else {
                        s.tasks_failed += 1;
                    }
                });
                if let Err(err) = result {
                    debug!(
                        worker = %name,
                        key = %task.key(),
                        destination = task.destination(),
                        error = %err,
                        "batch task failed"
                    );
                }
            });
        }
    }

    while running.join_next().await.is_some() {}
    info!(worker = %config.name, "batch queue worker stopped");
}

async fn idle(shutdown_rx: &mut watch::Receiver<bool>, poll_interval: Duration) {
    tokio::select! {
        _ = shutdown_rx.changed() => {}
        _ = tokio::time::sleep(poll_interval) => {}
    }
}
