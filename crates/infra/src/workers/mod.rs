//! Background workers driving the orchestrator.
//!
//! - `QueueWorker`: claims due queue messages and runs them with bounded concurrency.
//! - `SweepScheduler`: runs the periodic sweep on an interval.

pub mod queue_worker;
pub mod sweep;

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use queue_worker::{QueueWorker, WorkerConfig, WorkerStats};
pub use sweep::{SweepConfig, SweepScheduler, SweepStats};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle<T> {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<T>>,
}

impl<T: Clone + Default> WorkerHandle<T> {
    fn new(shutdown: watch::Sender<bool>, join: JoinHandle<()>, stats: Arc<Mutex<T>>) -> Self {
        Self {
            shutdown,
            join: Some(join),
            stats,
        }
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    /// Current runtime statistics.
    pub fn stats(&self) -> T {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

fn update<T>(stats: &Mutex<T>, f: impl FnOnce(&mut T)) {
    if let Ok(mut s) = stats.lock() {
        f(&mut s);
    }
}

/// Shutdown was requested or the handle is gone.
fn stopping(shutdown_rx: &watch::Receiver<bool>) -> bool {
    *shutdown_rx.borrow() || shutdown_rx.has_changed().is_err()
}
