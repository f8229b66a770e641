//! Process configuration read from the environment.

use std::net::SocketAddr;
use std::time::Duration;

use chunkline_infra::{OrchestratorConfig, SweepConfig, WorkerConfig};
use chunkline_observability::LogFormat;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub log_format: LogFormat,
    /// Postgres record store + Redis queue instead of in-memory ones.
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub chunk_timeout: Duration,
    pub sweep_interval: Duration,
    pub worker_concurrency: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        let orchestrator = OrchestratorConfig::default();
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_format: LogFormat::Json,
            use_persistent_stores: false,
            database_url: None,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            chunk_timeout: orchestrator.chunk_timeout,
            sweep_interval: SweepConfig::default().interval,
            worker_concurrency: WorkerConfig::default().max_concurrent,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// `LOG_FORMAT` alone, read without logging so tracing can be set up before
    /// [`Self::from_env`] reports bad values.
    pub fn log_format_from_env() -> LogFormat {
        Self::log_format_from_lookup(|name| std::env::var(name).ok())
    }

    pub fn log_format_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> LogFormat {
        lookup("LOG_FORMAT")
            .and_then(|raw| LogFormat::parse(&raw))
            .unwrap_or(LogFormat::Json)
    }

    /// Build from any variable source. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let bind_addr = parsed(&lookup, "BIND_ADDR", defaults.bind_addr, DEFAULT_BIND_ADDR);
        if let Some(raw) = lookup("LOG_FORMAT").filter(|raw| LogFormat::parse(raw).is_none()) {
            tracing::warn!(value = %raw, "LOG_FORMAT not recognised; using json");
        }
        let log_format = Self::log_format_from_lookup(&lookup);
        let use_persistent_stores = parsed(&lookup, "USE_PERSISTENT_STORES", false, "false");
        let chunk_timeout_secs = parsed(
            &lookup,
            "CHUNK_TIMEOUT_SECS",
            defaults.chunk_timeout.as_secs(),
            "3600",
        );
        let sweep_interval_secs = parsed(
            &lookup,
            "SWEEP_INTERVAL_SECS",
            defaults.sweep_interval.as_secs(),
            "300",
        );
        let worker_concurrency = parsed(
            &lookup,
            "WORKER_CONCURRENCY",
            defaults.worker_concurrency,
            "4",
        );

        Self {
            bind_addr,
            log_format,
            use_persistent_stores,
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            chunk_timeout: Duration::from_secs(chunk_timeout_secs.max(1)),
            sweep_interval: Duration::from_secs(sweep_interval_secs.max(1)),
            worker_concurrency: worker_concurrency.max(1),
        }
    }

    /// Orchestrator settings; the lease and the lock wait are kept above the chunk
    /// timeout.
    pub fn orchestrator(&self) -> OrchestratorConfig {
        let defaults = OrchestratorConfig::default();
        let lease = defaults.lock_lease.max(self.chunk_timeout * 2);
        defaults
            .with_chunk_timeout(self.chunk_timeout)
            .with_lock_lease(lease)
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig::default().with_max_concurrent(self.worker_concurrency)
    }

    pub fn sweep(&self) -> SweepConfig {
        SweepConfig::default().with_interval(self.sweep_interval)
    }
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    shown_default: &str,
) -> T {
    let Some(raw) = lookup(name) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, default = shown_default, "invalid value; using default");
            default
        }
    }
}
