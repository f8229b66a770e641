use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::orchestrator::{BatchOrchestrator, SweepReport};
use crate::queue::TaskQueue;
use crate::store::RecordStore;

use super::{stopping, update, WorkerHandle};

/// Sweep schedule.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub interval: Duration,
    pub name: String,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            name: "batch-sweep".to_string(),
        }
    }
}

impl SweepConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SweepStats {
    pub sweeps_run: u64,
    pub sweeps_failed: u64,
    pub last_report: Option<SweepReport>,
}

/// Runs `check_all` on a fixed cadence; the first sweep runs at startup.
#[derive(Debug)]
pub struct SweepScheduler;

impl SweepScheduler {
    pub fn spawn<S, Q>(
        orchestrator: Arc<BatchOrchestrator<S, Q>>,
        config: SweepConfig,
    ) -> WorkerHandle<SweepStats>
    where
        S: RecordStore + 'static,
        Q: TaskQueue + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(SweepStats::default()));
        let join = tokio::spawn(sweep_loop(orchestrator, config, shutdown_rx, stats.clone()));
        WorkerHandle::new(shutdown_tx, join, stats)
    }
}

async fn sweep_loop<S, Q>(
    orchestrator: Arc<BatchOrchestrator<S, Q>>,
    config: SweepConfig,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: Arc<Mutex<SweepStats>>,
) where
    S: RecordStore + 'static,
    Q: TaskQueue + 'static,
{
    info!(sweep = %config.name, interval_secs = config.interval.as_secs(), "batch sweep started");

    let mut ticker = tokio::time::interval(config.interval);
    // Overrunning sweeps push the next tick back instead of bursting.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.changed() => {}
        }
        if stopping(&shutdown_rx) {
            break;
        }

        match orchestrator.check_all().await {
            Ok(report) => update(&stats, |s| {
                s.sweeps_run += 1;
                s.last_report = Some(report);
            }),
            Err(err) => {
                error!(sweep = %config.name, error = %err, "batch sweep failed");
                update(&stats, |s| {
                    s.sweeps_run += 1;
                    s.sweeps_failed += 1;
                });
            }
        }
    }

    info!(sweep = %config.name, "batch sweep stopped");
}
