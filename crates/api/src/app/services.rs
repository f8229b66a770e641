use std::sync::Arc;

use chunkline_core::{BatchConfig, BatchKey, BatchResult};
use chunkline_infra::workers::{SweepStats, WorkerStats};
use chunkline_infra::{
    BatchOrchestrator, BatchStatus, HandlerRegistry, InMemoryRecordStore, InMemoryTaskQueue,
    OrchestratorConfig, QueueWorker, ResumeOutcome, SweepReport, SweepScheduler, WorkerHandle,
};

#[cfg(feature = "redis")]
use chunkline_infra::{PostgresRecordStore, queue::RedisTaskQueue};
#[cfg(feature = "redis")]
use sqlx::PgPool;

use crate::config::AppConfig;

pub type InMemoryOrchestrator =
    BatchOrchestrator<Arc<InMemoryRecordStore>, Arc<InMemoryTaskQueue>>;

#[cfg(feature = "redis")]
pub type PersistentOrchestrator =
    BatchOrchestrator<Arc<PostgresRecordStore>, Arc<RedisTaskQueue>>;

#[derive(Clone)]
pub enum AppServices {
    InMemory {
        orchestrator: Arc<InMemoryOrchestrator>,
    },
    #[cfg(feature = "redis")]
    Persistent {
        orchestrator: Arc<PersistentOrchestrator>,
    },
}

/// Running background workers.
pub struct Workers {
    pub queue: WorkerHandle<WorkerStats>,
    pub sweep: WorkerHandle<SweepStats>,
}

impl Workers {
    pub async fn shutdown(self) {
        self.queue.shutdown().await;
        self.sweep.shutdown().await;
    }
}

/// Pick backends from `config`: Postgres + Redis when persistent stores are requested and
/// the `redis` feature is on, in-memory otherwise.
pub async fn build_services(
    config: &AppConfig,
    handlers: HandlerRegistry,
) -> anyhow::Result<AppServices> {
    let orchestrator_config = config.orchestrator();
    orchestrator_config.validate()?;

    if config.use_persistent_stores {
        #[cfg(feature = "redis")]
        {
            return build_persistent_services(config, handlers, orchestrator_config).await;
        }
        #[cfg(not(feature = "redis"))]
        {
            tracing::warn!(
                "USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory"
            );
        }
    }

    Ok(AppServices::in_memory(handlers, orchestrator_config))
}

#[cfg(feature = "redis")]
async fn build_persistent_services(
    config: &AppConfig,
    handlers: HandlerRegistry,
    orchestrator_config: OrchestratorConfig,
) -> anyhow::Result<AppServices> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set when USE_PERSISTENT_STORES=true"))?;

    let pool = PgPool::connect(database_url).await?;
    let store = Arc::new(PostgresRecordStore::with_config(
        pool,
        orchestrator_config.store_config(),
    ));
    store.ensure_schema().await?;

    let queue = Arc::new(RedisTaskQueue::new(&config.redis_url, None)?);

    tracing::info!(redis_url = %config.redis_url, "using postgres record store and redis queue");
    let orchestrator =
        BatchOrchestrator::new(store, queue, handlers).with_config(orchestrator_config);
    Ok(AppServices::Persistent {
        orchestrator: Arc::new(orchestrator),
    })
}

impl AppServices {
    /// In-memory store and queue (dev/test).
    pub fn in_memory(handlers: HandlerRegistry, config: OrchestratorConfig) -> Self {
        let store = Arc::new(InMemoryRecordStore::with_config(config.store_config()));
        let queue = Arc::new(InMemoryTaskQueue::new());
        let orchestrator = BatchOrchestrator::new(store, queue, handlers).with_config(config);
        Self::InMemory {
            orchestrator: Arc::new(orchestrator),
        }
    }

    pub fn backend(&self) -> &'static str {
        match self {
            AppServices::InMemory { .. } => "in_memory",
            #[cfg(feature = "redis")]
            AppServices::Persistent { .. } => "postgres_redis",
        }
    }

    pub fn handler_names(&self) -> Vec<String> {
        match self {
            AppServices::InMemory { orchestrator } => orchestrator.handlers().names(),
            #[cfg(feature = "redis")]
            AppServices::Persistent { orchestrator } => orchestrator.handlers().names(),
        }
    }

    pub async fn start(
        &self,
        key: &BatchKey,
        config: &BatchConfig,
        restart: bool,
        use_last_count_as_expected: bool,
    ) -> BatchResult<BatchStatus> {
        match self {
            AppServices::InMemory { orchestrator } => {
                orchestrator
                    .start(key, config, restart, use_last_count_as_expected)
                    .await
            }
            #[cfg(feature = "redis")]
            AppServices::Persistent { orchestrator } => {
                orchestrator
                    .start(key, config, restart, use_last_count_as_expected)
                    .await
            }
        }
    }

    pub async fn resume(&self, key: &BatchKey) -> BatchResult<ResumeOutcome> {
        match self {
            AppServices::InMemory { orchestrator } => orchestrator.resume(key).await,
            #[cfg(feature = "redis")]
            AppServices::Persistent { orchestrator } => orchestrator.resume(key).await,
        }
    }

    pub async fn cancel(&self, key: &BatchKey) -> BatchResult<BatchStatus> {
        match self {
            AppServices::InMemory { orchestrator } => orchestrator.cancel(key).await,
            #[cfg(feature = "redis")]
            AppServices::Persistent { orchestrator } => orchestrator.cancel(key).await,
        }
    }

    pub async fn status(&self, key: &BatchKey) -> BatchResult<BatchStatus> {
        match self {
            AppServices::InMemory { orchestrator } => orchestrator.status(key).await,
            #[cfg(feature = "redis")]
            AppServices::Persistent { orchestrator } => orchestrator.status(key).await,
        }
    }

    pub async fn check_all(&self) -> BatchResult<SweepReport> {
        match self {
            AppServices::InMemory { orchestrator } => orchestrator.check_all().await,
            #[cfg(feature = "redis")]
            AppServices::Persistent { orchestrator } => orchestrator.check_all().await,
        }
    }

    pub async fn clean_all(&self) -> BatchResult<usize> {
        match self {
            AppServices::InMemory { orchestrator } => orchestrator.clean_all().await,
            #[cfg(feature = "redis")]
            AppServices::Persistent { orchestrator } => orchestrator.clean_all().await,
        }
    }

    /// Start the queue worker and the sweep scheduler.
    pub fn spawn_workers(&self, config: &AppConfig) -> Workers {
        match self {
            AppServices::InMemory { orchestrator } => Workers {
                queue: QueueWorker::spawn(orchestrator.clone(), config.worker()),
                sweep: SweepScheduler::spawn(orchestrator.clone(), config.sweep()),
            },
            #[cfg(feature = "redis")]
            AppServices::Persistent { orchestrator } => Workers {
                queue: QueueWorker::spawn(orchestrator.clone(), config.worker()),
                sweep: SweepScheduler::spawn(orchestrator.clone(), config.sweep()),
            },
        }
    }
}
