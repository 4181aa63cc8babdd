//! Worker runtime: claims queued jobs and runs them under a bounded pool.
//!
//! ## Lifecycle
//!
//! 1. `start` clears orphaned claim markers, then runs one reconciliation sweep.
//! 2. The claim loop takes a slot from the job semaphore, claims the next
//!    ready entry and runs it on its own task under the job timeout.
//! 3. A periodic reconciler runs alongside until shutdown.
//!
//! ## Failure policy
//!
//! - Retryable handler error: re-queued after `retry_delay`, up to `max_retries` times.
//! - Non-retryable error, exhausted retries or timeout: the job is failed.
//! - Timed-out runs are dropped mid-flight, fan-out work included; nothing
//!   from them is persisted.
//! - Every failure or retry the runtime records also rewrites the progress
//!   record from the run's latest update, keeping its percentage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use inkwell_ai::GenerationError;
use inkwell_core::{JobId, JobKind, JobTransition, Stage};

use crate::config::{ReconcileConfig, WorkerConfig};
use crate::progress::{LatestProgress, carry_forward};

use super::queue::{JobQueue, QueueError};
use super::reconciler::{Reconciler, ReconcilerHandle};
use super::store::{JobStore, JobStoreError};
use super::types::{JobOutput, QueuedJob, RetryPolicy};

/// Per-run context handed to a handler.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub kind: JobKind,
    /// 1-indexed job-level attempt
    pub attempt: u32,
    pub store: Arc<dyn JobStore>,
    /// Handlers report through this so the runtime can settle progress
    pub progress: LatestProgress,
}

/// Handler failure.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A stage the job cannot complete without failed.
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: GenerationError,
    },

    #[error("artifact unavailable: {0}")]
    Artifact(String),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Whether a job-level re-run may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::Stage { source, .. } => source.is_retryable(),
            JobError::Store(_) => true,
            JobError::InvalidPayload(_) | JobError::Artifact(_) | JobError::Internal(_) => false,
        }
    }
}

/// Runs one kind of job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext, payload: serde_json::Value) -> Result<JobOutput, JobError>;
}

/// Outcome of a single job run, as seen by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Retrying { next_attempt: u32 },
    Failed { error: String },
    /// The job record no longer exists (or the store refused the start).
    Skipped,
}

/// The job-level runtime; construct once per process.
pub struct WorkerRuntime {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
    config: WorkerConfig,
    reconcile: ReconcileConfig,
}

impl WorkerRuntime {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        config: WorkerConfig,
        reconcile: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            queue,
            handlers: HashMap::new(),
            config,
            reconcile,
        }
    }

    /// Register the handler for a job kind (replacing any previous one).
    pub fn register_handler(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn with_handler(mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> Self {
        self.register_handler(kind, handler);
        self
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.config.max_retries, self.config.retry_delay)
    }

    /// Startup cleanup, then the claim loop and periodic reconciler.
    ///
    /// Fails only if the startup cleanup cannot reach the queue or store;
    /// nothing is claimed in that case.
    pub async fn start(self) -> Result<RuntimeHandle, StartupError> {
        let cleared = self.queue.clear_orphaned_claims().await?;
        if cleared > 0 {
            warn!(worker = %self.config.name, cleared, "cleared orphaned claim markers");
        }

        let reconciler = Reconciler::new(self.store.clone(), self.reconcile.clone());
        reconciler.sweep_once().await?;
        let reconciler = reconciler.spawn();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runtime = Arc::new(self);
        let join = tokio::spawn(claim_loop(runtime.clone(), shutdown_rx));

        info!(
            worker = %runtime.config.name,
            max_concurrent_jobs = runtime.config.max_concurrent_jobs,
            job_timeout_secs = runtime.config.job_timeout.as_secs(),
            "worker runtime started"
        );

        Ok(RuntimeHandle {
            shutdown: shutdown_tx,
            join,
            reconciler,
        })
    }

    /// Run one claimed entry to an outcome and settle it in store and queue.
    pub async fn run_job(&self, entry: QueuedJob) -> RunOutcome {
        let job_id = entry.job_id;

        match self.store.transition(job_id, JobTransition::start(Utc::now())).await {
            Ok(_) => {}
            Err(JobStoreError::NotFound(_)) => {
                warn!(job_id = %job_id, "queued job has no record, dropping");
                self.ack(job_id).await;
                return RunOutcome::Skipped;
            }
            Err(e) => {
                // Leave the claim in place; the marker expires or is cleared on restart.
                error!(job_id = %job_id, error = %e, "failed to mark job running");
                return RunOutcome::Skipped;
            }
        }

        let latest = LatestProgress::default();
        let Some(handler) = self.handlers.get(&entry.kind).cloned() else {
            let error = format!("no handler for job kind: {}", entry.kind);
            return self.fail(job_id, error, &latest).await;
        };

        let ctx = JobContext {
            job_id,
            kind: entry.kind,
            attempt: entry.attempt,
            store: self.store.clone(),
            progress: latest.clone(),
        };

        let timeout = self.config.job_timeout;
        let result = match tokio::time::timeout(timeout, handler.handle(ctx, entry.payload.clone())).await {
            Ok(result) => result,
            Err(_) => {
                warn!(job_id = %job_id, timeout_secs = timeout.as_secs_f64(), "job timed out");
                return self.fail(job_id, timeout_message(timeout), &latest).await;
            }
        };

        let error = match result {
            Ok(output) => match self.complete(job_id, &output).await {
                Ok(()) => {
                    self.ack(job_id).await;
                    info!(job_id = %job_id, attempt = entry.attempt, "job completed");
                    return RunOutcome::Completed;
                }
                Err(e) => JobError::Store(e),
            },
            Err(e) => e,
        };

        if error.is_retryable() && self.retry_policy().should_retry(entry.attempt) {
            let next = entry.retry_after(self.config.retry_delay);
            let next_attempt = next.attempt;
            warn!(
                job_id = %job_id,
                attempt = entry.attempt,
                next_attempt,
                error = %error,
                "job failed, scheduling retry"
            );
            self.ack(job_id).await;
            match self.queue.push(next).await {
                Ok(()) => {
                    let stage = match latest.get().map(|r| r.stage) {
                        Some(stage @ (Stage::Text | Stage::References | Stage::Illustrations)) => stage,
                        _ => Stage::Text,
                    };
                    self.settle_progress(job_id, &latest, stage, format!("retrying: attempt {next_attempt}"))
                        .await;
                    return RunOutcome::Retrying { next_attempt };
                }
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "failed to re-queue job");
                    return self
                        .fail(job_id, format!("{error} (re-queue failed: {e})"), &latest)
                        .await;
                }
            }
        }

        self.fail(job_id, error.to_string(), &latest).await
    }

    async fn complete(&self, job_id: JobId, output: &JobOutput) -> Result<(), JobStoreError> {
        let result_ref = self.store.save_output(job_id, output).await?;
        self.store
            .transition(job_id, JobTransition::complete(Utc::now(), result_ref))
            .await?;
        Ok(())
    }

    async fn fail(&self, job_id: JobId, error: String, latest: &LatestProgress) -> RunOutcome {
        warn!(job_id = %job_id, error = %error, "job failed");
        self.settle_progress(job_id, latest, Stage::Failed, error.clone()).await;
        if let Err(e) = self
            .store
            .transition(job_id, JobTransition::fail(Utc::now(), error.clone()))
            .await
        {
            error!(job_id = %job_id, error = %e, "failed to record job failure");
        }
        self.ack(job_id).await;
        RunOutcome::Failed { error }
    }

    /// Rewrite the progress record from the run's latest update.
    ///
    /// Falls back to the persisted record when the run reported nothing.
    async fn settle_progress(&self, job_id: JobId, latest: &LatestProgress, stage: Stage, detail: String) {
        let previous = match latest.get() {
            Some(record) => Some(record),
            None => match self.store.get(job_id).await {
                Ok(job) => job.and_then(|job| job.progress),
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "failed to read progress");
                    None
                }
            },
        };
        let record = carry_forward(previous, stage, detail);
        if let Err(e) = self.store.update_progress(job_id, &record).await {
            warn!(job_id = %job_id, error = %e, "failed to write progress");
        }
    }

    async fn ack(&self, job_id: JobId) {
        if let Err(e) = self.queue.ack(job_id).await {
            error!(job_id = %job_id, error = %e, "failed to ack queue entry");
        }
    }
}

fn timeout_message(timeout: Duration) -> String {
    if timeout.as_secs() > 0 && timeout.subsec_nanos() == 0 {
        format!("job timed out after {}s", timeout.as_secs())
    } else {
        format!("job timed out after {}ms", timeout.as_millis())
    }
}

/// Runtime could not finish its startup cleanup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("orphaned claim cleanup failed: {0}")]
    Queue(#[from] QueueError),
    #[error("startup reconciliation failed: {0}")]
    Store(#[from] JobStoreError),
}

/// Handle to a running worker runtime.
///
/// Dropping the handle stops the runtime the same way `shutdown` does, but
/// without waiting for it.
#[derive(Debug)]
#[must_use = "dropping the handle stops the worker runtime"]
pub struct RuntimeHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    reconciler: ReconcilerHandle,
}

impl RuntimeHandle {
    /// Stop claiming, wait for in-flight jobs, stop the reconciler.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
        self.reconciler.shutdown().await;
    }
}

/// Runs until shutdown is requested or the `RuntimeHandle` is dropped.
async fn claim_loop(runtime: Arc<WorkerRuntime>, mut shutdown: watch::Receiver<bool>) {
    let slots = runtime.config.max_concurrent_jobs.max(1);
    let semaphore = Arc::new(Semaphore::new(slots));
    let name = runtime.config.name.clone();

    loop {
        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        match runtime.queue.claim(&name).await {
            Ok(Some(entry)) => {
                debug!(worker = %name, job_id = %entry.job_id, kind = %entry.kind, attempt = entry.attempt, "claimed job");
                let runtime = runtime.clone();
                let span = info_span!("job", job_id = %entry.job_id, kind = %entry.kind);
                tokio::spawn(
                    async move {
                        let _permit = permit;
                        runtime.run_job(entry).await;
                    }
                    .instrument(span),
                );
            }
            Ok(None) => {
                drop(permit);
                if idle(&mut shutdown, runtime.config.poll_interval).await {
                    break;
                }
            }
            Err(e) => {
                drop(permit);
                error!(worker = %name, error = %e, "failed to claim job");
                if idle(&mut shutdown, runtime.config.poll_interval).await {
                    break;
                }
            }
        }
    }

    // Wait for in-flight jobs.
    let _ = semaphore.acquire_many(slots as u32).await;
    info!(worker = %name, "worker runtime stopped");
}

/// Sleep for `period`; true if shutdown was requested meanwhile.
async fn idle(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(period) => false,
    }
}
