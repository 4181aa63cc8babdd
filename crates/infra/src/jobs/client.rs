//! Enqueue side of the job system.

use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use inkwell_core::{Job, JobId, JobKind};

use super::queue::{JobQueue, QueueError};
use super::store::{JobStore, JobStoreError};
use super::types::QueuedJob;

/// Enqueue failure. Either way no job is left behind for the caller.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("failed to create job record: {0}")]
    Store(#[from] JobStoreError),
    #[error("failed to queue job: {0}")]
    Queue(#[from] QueueError),
}

/// Creates job records and puts them on the queue.
#[derive(Clone)]
pub struct JobClient {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
}

impl JobClient {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self { store, queue }
    }

    /// Create a pending job and queue it. Returns the job id.
    ///
    /// The record is written first; if the push then fails the record is
    /// removed again. Should that removal fail too, the pending record is
    /// reclaimed by the next sweep after `pending_ttl`.
    #[instrument(skip(self, payload), fields(kind = %kind), err)]
    pub async fn enqueue(&self, kind: JobKind, payload: serde_json::Value) -> Result<JobId, EnqueueError> {
        let job = Job::new(kind, payload.clone());
        let job_id = self.store.create(job).await?;

        if let Err(e) = self.queue.push(QueuedJob::new(job_id, kind, payload)).await {
            warn!(job_id = %job_id, error = %e, "queue push failed, removing job record");
            if let Err(cleanup) = self.store.delete(job_id).await {
                error!(job_id = %job_id, error = %cleanup, "failed to remove unqueued job record");
            }
            return Err(e.into());
        }

        info!(job_id = %job_id, kind = %kind, "job enqueued");
        Ok(job_id)
    }
}
