//! Configuration loading and representation.
//!
//! Every value has a default; `Config::from_env` overrides from `INKWELL_*`
//! variables (`DATABASE_URL` / `REDIS_URL` for the backends).

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Job-level worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Name for logging and claim ownership
    pub name: String,
    pub max_concurrent_jobs: usize,
    /// Hard wall-clock limit per job run
    pub job_timeout: Duration,
    /// Job-level re-runs after a retryable handler error
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// How long to idle when the queue is empty
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "inkwell-worker".to_string(),
            max_concurrent_jobs: 2,
            job_timeout: Duration::from_secs(600),
            max_retries: 3,
            retry_delay: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = delay;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Stale-job sweep settings.
///
/// `running_ttl` must exceed the longest legitimate job run, otherwise the
/// sweep can fail a job that is still making progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    pub pending_ttl: Duration,
    pub running_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            pending_ttl: Duration::from_secs(120),
            running_ttl: Duration::from_secs(720),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Settings of the generation pipeline inside one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub reference_concurrency: usize,
    pub illustration_concurrency: usize,
    /// Content units requested from the text stage
    pub unit_count: u32,
    /// Generation attempts per artifact
    pub max_attempts: u32,
    /// Debounce window for progress writes
    pub progress_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            reference_concurrency: 4,
            illustration_concurrency: 6,
            unit_count: 12,
            max_attempts: 3,
            progress_interval: Duration::from_millis(500),
        }
    }
}

/// Complete process configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub worker: WorkerConfig,
    pub reconcile: ReconcileConfig,
    pub pipeline: PipelineConfig,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (defaults for missing keys).
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Config::default();

        if let Some(name) = lookup("INKWELL_WORKER_NAME") {
            cfg.worker.name = name;
        }
        set(&lookup, "INKWELL_MAX_CONCURRENT_JOBS", &mut cfg.worker.max_concurrent_jobs)?;
        set_secs(&lookup, "INKWELL_JOB_TIMEOUT_SECONDS", &mut cfg.worker.job_timeout)?;
        set(&lookup, "INKWELL_MAX_RETRIES", &mut cfg.worker.max_retries)?;
        set_secs(&lookup, "INKWELL_RETRY_DELAY_SECONDS", &mut cfg.worker.retry_delay)?;
        set_millis(&lookup, "INKWELL_POLL_INTERVAL_MS", &mut cfg.worker.poll_interval)?;

        set_secs(&lookup, "INKWELL_PENDING_TTL_SECONDS", &mut cfg.reconcile.pending_ttl)?;
        set_secs(&lookup, "INKWELL_RUNNING_TTL_SECONDS", &mut cfg.reconcile.running_ttl)?;
        set_secs(&lookup, "INKWELL_SWEEP_INTERVAL_SECONDS", &mut cfg.reconcile.sweep_interval)?;

        set(&lookup, "INKWELL_REFERENCE_CONCURRENCY", &mut cfg.pipeline.reference_concurrency)?;
        set(
            &lookup,
            "INKWELL_ILLUSTRATION_CONCURRENCY",
            &mut cfg.pipeline.illustration_concurrency,
        )?;
        set(&lookup, "INKWELL_UNIT_COUNT", &mut cfg.pipeline.unit_count)?;
        set(&lookup, "INKWELL_MAX_ATTEMPTS", &mut cfg.pipeline.max_attempts)?;
        set_millis(&lookup, "INKWELL_PROGRESS_INTERVAL_MS", &mut cfg.pipeline.progress_interval)?;

        cfg.database_url = lookup("DATABASE_URL");
        cfg.redis_url = lookup("REDIS_URL");

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.worker.max_concurrent_jobs > 0, "max_concurrent_jobs must be > 0");
        anyhow::ensure!(self.pipeline.reference_concurrency > 0, "reference_concurrency must be > 0");
        anyhow::ensure!(
            self.pipeline.illustration_concurrency > 0,
            "illustration_concurrency must be > 0"
        );
        anyhow::ensure!(self.pipeline.max_attempts > 0, "max_attempts must be > 0");
        // The sweep would otherwise fail jobs that are still inside their timeout.
        anyhow::ensure!(
            self.reconcile.running_ttl > self.worker.job_timeout,
            "running_ttl ({}s) must exceed job_timeout ({}s)",
            self.reconcile.running_ttl.as_secs(),
            self.worker.job_timeout.as_secs()
        );
        Ok(())
    }
}

fn set<F, T>(lookup: &F, key: &str, slot: &mut T) -> anyhow::Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}"))?;
    }
    Ok(())
}

fn set_secs<F>(lookup: &F, key: &str, slot: &mut Duration) -> anyhow::Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let mut secs = slot.as_secs();
    set(lookup, key, &mut secs)?;
    *slot = Duration::from_secs(secs);
    Ok(())
}

fn set_millis<F>(lookup: &F, key: &str, slot: &mut Duration) -> anyhow::Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let mut millis = slot.as_millis() as u64;
    set(lookup, key, &mut millis)?;
    *slot = Duration::from_millis(millis);
    Ok(())
}
