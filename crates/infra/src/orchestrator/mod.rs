//! Batch orchestrator: drives chunked jobs to completion.
//!
//! ## Flow
//!
//! 1. `start` merges configuration into the record (blocking lock), resets it when a new
//!    run is due, and schedules an immediate `resume`.
//! 2. `resume` (non-blocking lock, dropped on contention) runs exactly one chunk,
//!    persists progress, and either finishes the job or schedules the next chunk at the
//!    paced delay.
//! 3. `check_all` re-arms stalled jobs and schedules cleanup of stale records.
//!
//! Follow-up messages are enqueued only after the record is saved and its lock released,
//! so the next trigger never finds the lock still held by the run that scheduled it.

mod config;
mod status;

pub use config::OrchestratorConfig;
pub use status::{BatchStatus, ResumeOutcome, SweepReport};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use chunkline_core::{
    Action, BatchConfig, BatchError, BatchKey, BatchRecord, BatchResult, Clock, LeaseToken,
    MAX_DURATION, RetryHint, SystemClock,
};

use crate::handler::{BatchContext, DynBatchHandler, HandlerRegistry};
use crate::notify::{render_template, Notification, NotificationSink, TracingNotificationSink};
use crate::queue::{BatchTask, TaskQueue};
use crate::store::{IfMissing, LockMode, LockedRecord, Lookup, RecordStore, StoreError};

/// Drives batch records through their lifecycle.
pub struct BatchOrchestrator<S, Q> {
    store: S,
    queue: Q,
    handlers: Arc<HandlerRegistry>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
}

impl<S, Q> std::fmt::Debug for BatchOrchestrator<S, Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOrchestrator")
            .field("handlers", &self.handlers)
            .field("config", &self.config)
            .finish()
    }
}

impl<S, Q> BatchOrchestrator<S, Q>
where
    S: RecordStore,
    Q: TaskQueue,
{
    pub fn new(store: S, queue: Q, handlers: HandlerRegistry) -> Self {
        Self {
            store,
            queue,
            handlers: Arc::new(handlers),
            notifier: Arc::new(TracingNotificationSink),
            clock: Arc::new(SystemClock),
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Configure and (re)start a job, then schedule its first chunk immediately.
    ///
    /// The job is reset when `restart` is set or when the previous run is expired or
    /// finished; with `use_last_count_as_expected` the previous run's count becomes the
    /// new expected count.
    #[instrument(skip(self, config), fields(key = %key), err)]
    pub async fn start(
        &self,
        key: &BatchKey,
        config: &BatchConfig,
        restart: bool,
        use_last_count_as_expected: bool,
    ) -> BatchResult<BatchStatus> {
        config.validate()?;
        self.check_handlers_exist(key, config).await?;

        let now = self.clock.now();
        let LockedRecord { mut record, lease } =
            expect_found(key, self.store.lock(key, LockMode::Wait, now).await?)?;

        let prepared = self.prepare_start(
            &mut record,
            config,
            restart,
            use_last_count_as_expected,
            now,
        );
        let saved = match prepared {
            Ok(()) => self.store.save(&record).await.map_err(BatchError::from),
            Err(err) => Err(err),
        };
        self.release(key, lease).await;
        saved?;

        self.schedule(&BatchTask::Resume { key: key.clone() }, Duration::ZERO)
            .await?;

        info!(
            handler = record.handler_name().unwrap_or("-"),
            processed = record.processed_count(),
            "batch started"
        );
        Ok(BatchStatus::from_record(&record, now))
    }

    /// Run the next chunk of a job.
    ///
    /// A trigger that finds the job locked, absent or finished is a no-op. An expired
    /// job fails with [`BatchError::Expired`] and is never rescheduled. Any other failure
    /// is rescheduled (at the failure's suggested delay, else the paced delay) unless it
    /// is explicitly non-retriable, and then returned.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn resume(&self, key: &BatchKey) -> BatchResult<ResumeOutcome> {
        let lookup = self
            .store
            .find(key, LockMode::SkipIfLocked, IfMissing::Absent)
            .await?;
        let LockedRecord { mut record, lease } = match lookup {
            Lookup::Found(locked) => locked,
            Lookup::Absent => return Ok(ResumeOutcome::Absent),
            Lookup::Contended => {
                debug!("batch is running elsewhere; trigger dropped");
                return Ok(ResumeOutcome::Skipped);
            }
        };

        let now = self.clock.now();
        if record.is_finished() {
            self.release(key, lease).await;
            return Ok(ResumeOutcome::AlreadyFinished);
        }
        if record.is_expired(now) {
            self.release(key, lease).await;
            return Err(expired(&record));
        }

        let advanced = self.advance(&mut record).await;
        let saved = self.store.save(&record).await.map_err(BatchError::from);
        self.release(key, lease).await;

        let result = match (advanced, saved) {
            (Ok(_), Err(save_err)) => Err(save_err),
            (Err(err), Err(save_err)) => {
                error!(error = %save_err, "failed to persist batch record after chunk failure");
                Err(err)
            }
            (advanced, Ok(())) => advanced,
        };

        match &result {
            Ok(ResumeOutcome::Advanced { next_run_at, .. }) => {
                let delay = non_negative(*next_run_at - self.clock.now());
                self.schedule(&BatchTask::Resume { key: key.clone() }, delay)
                    .await?;
            }
            Ok(ResumeOutcome::Finished { processed }) => {
                info!(processed, "batch finished");
            }
            Ok(_) => {}
            Err(err) if err.is_expired() => {
                debug!(error = %err, "batch expired during chunk");
            }
            Err(err) if err.is_non_retriable() => {
                warn!(error = %err, "batch chunk failed; not retrying");
            }
            Err(err) => {
                let delay = match err.retry_hint() {
                    Some(RetryHint::After(delay)) => delay,
                    _ => non_negative(record.paced_delay(self.clock.now())),
                };
                warn!(
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "batch chunk failed; retry scheduled"
                );
                if let Err(queue_err) = self
                    .schedule(&BatchTask::Resume { key: key.clone() }, delay)
                    .await
                {
                    error!(error = %queue_err, "failed to schedule batch retry");
                }
            }
        }

        result
    }

    /// Stop future chunks. An in-flight chunk runs to completion.
    #[instrument(skip(self), fields(key = %key), err)]
    pub async fn cancel(&self, key: &BatchKey) -> BatchResult<BatchStatus> {
        let lookup = self
            .store
            .find(key, LockMode::Wait, IfMissing::Absent)
            .await?;
        let LockedRecord { mut record, lease } = match lookup {
            Lookup::Found(locked) => locked,
            Lookup::Absent => return Err(BatchError::not_found(key.suffix())),
            Lookup::Contended => return Err(StoreError::LockTimeout(key.record_key()).into()),
        };

        let now = self.clock.now();
        record.cancel(now);
        let saved = self.store.save(&record).await;
        self.release(key, lease).await;
        saved?;

        info!(processed = record.processed_count(), "batch cancelled");
        Ok(BatchStatus::from_record(&record, now))
    }

    /// Current state of a job.
    pub async fn status(&self, key: &BatchKey) -> BatchResult<BatchStatus> {
        match self
            .store
            .find(key, LockMode::None, IfMissing::Absent)
            .await?
        {
            Lookup::Found(locked) => Ok(BatchStatus::from_record(&locked.record, self.clock.now())),
            _ => Err(BatchError::not_found(key.suffix())),
        }
    }

    /// Periodic sweep over every record.
    ///
    /// Records past retention get a cleanup task; running records get a resume at their
    /// next run time (immediately when no chunk has run yet).
    #[instrument(skip(self), err)]
    pub async fn check_all(&self) -> BatchResult<SweepReport> {
        let now = self.clock.now();
        let records = self
            .store
            .find_by_key_prefix(&self.config.key_prefix)
            .await?;

        let mut report = SweepReport {
            scanned: records.len(),
            ..SweepReport::default()
        };

        for record in &records {
            let key = record.key().clone();
            if record.should_be_cleaned(now) {
                self.schedule(&BatchTask::Clean { key }, Duration::ZERO).await?;
                report.cleanups_scheduled += 1;
            } else if !record.is_finished() && !record.is_expired(now) {
                let delay = record
                    .next_run_at(now)
                    .map(|at| non_negative(at - now))
                    .unwrap_or(Duration::ZERO);
                self.schedule(&BatchTask::Resume { key }, delay).await?;
                report.resumes_scheduled += 1;
            }
        }

        info!(
            scanned = report.scanned,
            resumes = report.resumes_scheduled,
            cleanups = report.cleanups_scheduled,
            "batch sweep complete"
        );
        Ok(report)
    }

    /// Delete the record if it is past retention. Returns whether it was deleted.
    #[instrument(skip(self), fields(key = %key), err)]
    pub async fn clean(&self, key: &BatchKey) -> BatchResult<bool> {
        let lookup = self
            .store
            .find(key, LockMode::SkipIfLocked, IfMissing::Absent)
            .await?;
        let LockedRecord { record, lease } = match lookup {
            Lookup::Found(locked) => locked,
            Lookup::Absent => return Ok(false),
            Lookup::Contended => {
                debug!("batch is locked; cleanup skipped");
                return Ok(false);
            }
        };

        let deleted = if record.should_be_cleaned(self.clock.now()) {
            self.store.delete(key).await.map_err(BatchError::from)
        } else {
            Ok(false)
        };
        self.release(key, lease).await;

        if matches!(deleted, Ok(true)) {
            info!("batch record deleted");
        }
        deleted
    }

    /// Delete every record past retention. Returns how many were deleted.
    #[instrument(skip(self), err)]
    pub async fn clean_all(&self) -> BatchResult<usize> {
        let now = self.clock.now();
        let records = self
            .store
            .find_by_key_prefix(&self.config.key_prefix)
            .await?;

        let mut deleted = 0;
        for record in records.iter().filter(|r| r.should_be_cleaned(now)) {
            if self.clean(record.key()).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Queue entry point: run a task, treating expiry as a normal outcome.
    pub async fn handle_task(&self, task: &BatchTask) -> BatchResult<()> {
        match task {
            BatchTask::Resume { key } => match self.resume(key).await {
                Ok(_) => Ok(()),
                Err(err) if err.is_expired() => {
                    debug!(key = %key, error = %err, "batch expired; not resuming");
                    Ok(())
                }
                Err(err) => Err(err),
            },
            BatchTask::Clean { key } => self.clean(key).await.map(|_| ()),
        }
    }

    async fn check_handlers_exist(&self, key: &BatchKey, config: &BatchConfig) -> BatchResult<()> {
        let names = config
            .handler_name
            .iter()
            .chain(config.action_bindings.iter().flat_map(|b| b.values()));
        for name in names {
            if !self.handlers.contains(name) {
                return Err(BatchError::UnknownHandler(name.clone()));
            }
        }

        if config.handler_name.is_none() {
            let existing = self
                .store
                .find(key, LockMode::None, IfMissing::Absent)
                .await?;
            let has_handler = matches!(
                &existing,
                Lookup::Found(locked) if locked.record.handler_name().is_some()
            );
            if !has_handler {
                return Err(BatchError::validation(
                    "handler_name is required for a new batch",
                ));
            }
        }
        Ok(())
    }

    fn prepare_start(
        &self,
        record: &mut BatchRecord,
        config: &BatchConfig,
        restart: bool,
        use_last_count_as_expected: bool,
        now: DateTime<Utc>,
    ) -> BatchResult<()> {
        record.apply_config(config);

        let reset = restart || record.is_expired(now) || record.is_finished();
        if reset {
            record.reset(use_last_count_as_expected, now);
        }

        let item_type = self.resolve(record, Action::Get)?.item_type();
        let keeps_foreign_cursor = !reset
            && record.cursor().is_some()
            && record.item_type().is_some_and(|recorded| recorded != item_type);
        if keeps_foreign_cursor {
            return Err(item_type_mismatch(record, item_type));
        }
        record.set_item_type(item_type);
        Ok(())
    }

    /// Steps after the terminal checks: lifecycle call, one chunk, finish or pace.
    async fn advance(&self, record: &mut BatchRecord) -> BatchResult<ResumeOutcome> {
        let ctx = BatchContext::new(record.key().clone(), record.query_arguments().clone());

        let fetcher = self.resolve(record, Action::Get)?;
        let item_type = fetcher.item_type();
        match record.item_type().map(|recorded| recorded == item_type) {
            Some(true) => {}
            Some(false) => return Err(item_type_mismatch(record, item_type)),
            None => record.set_item_type(item_type),
        }

        let previous_cursor = record.cursor().cloned();
        let action = if previous_cursor.is_none() {
            Action::Start
        } else {
            Action::Resume
        };
        let lifecycle = self.resolve(record, action)?;
        let called = match action {
            Action::Start => lifecycle.start(&ctx).await,
            _ => lifecycle.resume(&ctx).await,
        };
        called.map_err(|e| BatchError::handler(record.key().to_string(), action, e))?;
        self.notify(record, action);

        let chunk_started_at = self.clock.now();
        let chunk = tokio::time::timeout(
            self.config.chunk_timeout,
            self.run_chunk(record, &ctx, fetcher.as_ref()),
        )
        .await;
        match chunk {
            Ok(result) => result?,
            Err(_) => {
                return Err(BatchError::ChunkTimeout {
                    key: record.key().to_string(),
                    timeout: self.config.chunk_timeout,
                });
            }
        }
        let chunk_finished_at = self.clock.now();
        record.record_chunk(chunk_started_at, chunk_finished_at);

        if record.cursor() == previous_cursor.as_ref() {
            let finisher = self.resolve(record, Action::Finish)?;
            finisher
                .finish(&ctx)
                .await
                .map_err(|e| BatchError::handler(record.key().to_string(), Action::Finish, e))?;
            self.notify(record, Action::Finish);
            record.mark_finished(chunk_finished_at);
            return Ok(ResumeOutcome::Finished {
                processed: record.processed_count(),
            });
        }

        let next_run_at = record
            .next_run_at(chunk_finished_at)
            .unwrap_or(chunk_finished_at);
        debug!(
            processed = record.processed_count(),
            next_run_at = %next_run_at,
            "batch chunk complete"
        );
        Ok(ResumeOutcome::Advanced {
            processed: record.processed_count(),
            next_run_at,
        })
    }

    /// Fetch and process one chunk, advancing the cursor item by item.
    ///
    /// Progress is checkpointed on success; on failure the caller's save keeps whatever
    /// items were processed before it.
    async fn run_chunk(
        &self,
        record: &mut BatchRecord,
        ctx: &BatchContext,
        handler: &dyn DynBatchHandler,
    ) -> BatchResult<()> {
        if record.is_expired(self.clock.now()) {
            return Err(expired(record));
        }

        let key = record.key().to_string();
        let items = handler
            .get(ctx, record.cursor(), record.chunk_size())
            .await
            .map_err(|e| BatchError::handler(key.clone(), Action::Get, e))?;

        let executor = self.resolve(record, Action::Execute)?;
        for item in items {
            executor
                .execute(ctx, &item)
                .await
                .map_err(|e| BatchError::handler(key.clone(), Action::Execute, e))?;
            record.advance(item);
        }

        self.store.save(record).await?;
        Ok(())
    }

    fn resolve(&self, record: &BatchRecord, action: Action) -> BatchResult<Arc<dyn DynBatchHandler>> {
        let name = record.handler_for(action).ok_or_else(|| {
            BatchError::validation(format!("batch {} has no handler configured", record.key()))
        })?;
        self.handlers
            .get(name)
            .ok_or_else(|| BatchError::UnknownHandler(name.to_string()))
    }

    fn notify(&self, record: &BatchRecord, action: Action) {
        if !action.is_notifiable() {
            return;
        }
        let Some(template) = record.notification_template(action) else {
            return;
        };

        let elapsed_minutes = (self.clock.now() - record.started_at()).num_minutes();
        let notification = Notification {
            key: record.key().clone(),
            action,
            channel: record.notification_channel(action).map(str::to_string),
            message: render_template(template, record.key(), record.cursor(), elapsed_minutes),
        };
        if let Err(err) = self.notifier.deliver(&notification) {
            warn!(key = %record.key(), action = %action, error = %err, "batch notification dropped");
        }
    }

    async fn schedule(&self, task: &BatchTask, delay: Duration) -> BatchResult<()> {
        let delay = delay.min(MAX_DURATION);
        let message = task.to_message()?;
        self.queue
            .enqueue(message, delay, Some(&task.dedupe_key()))
            .await?;
        debug!(
            key = %task.key(),
            destination = task.destination(),
            delay_ms = delay.as_millis() as u64,
            "batch task scheduled"
        );
        Ok(())
    }

    async fn release(&self, key: &BatchKey, lease: Option<LeaseToken>) {
        let Some(lease) = lease else {
            return;
        };
        if let Err(err) = self.store.release(key, lease).await {
            error!(key = %key, error = %err, "failed to release batch lock");
        }
    }
}

fn expect_found(key: &BatchKey, lookup: Lookup) -> BatchResult<LockedRecord> {
    match lookup {
        Lookup::Found(locked) => Ok(locked),
        Lookup::Absent => Err(BatchError::not_found(key.suffix())),
        Lookup::Contended => Err(StoreError::LockTimeout(key.record_key()).into()),
    }
}

fn item_type_mismatch(record: &BatchRecord, handler_item_type: String) -> BatchError {
    BatchError::ItemTypeMismatch {
        key: record.key().to_string(),
        recorded: record.item_type().unwrap_or_default().to_string(),
        handler: handler_item_type,
    }
}

fn expired(record: &BatchRecord) -> BatchError {
    BatchError::Expired {
        key: record.key().to_string(),
        expires_at: record.expires_at(),
    }
}

/// Negative delays mean "now".
fn non_negative(delay: chrono::Duration) -> Duration {
    delay.to_std().unwrap_or(Duration::ZERO)
}
