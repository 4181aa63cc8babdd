//! Durable job queue abstraction and the in-memory implementation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use inkwell_core::JobId;

use super::types::QueuedJob;

/// Claim markers with this prefix belong to periodic jobs and survive startup cleanup.
pub const CRON_MARKER_PREFIX: &str = "cron:";

/// Queue of jobs waiting for a worker.
///
/// A claimed entry stays in the queue, hidden behind a claim marker, until it
/// is acknowledged. A worker that dies mid-run leaves its marker behind;
/// `clear_orphaned_claims` makes those entries claimable again.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, job: QueuedJob) -> Result<(), QueueError>;

    /// Claim the oldest ready, unclaimed entry.
    async fn claim(&self, worker: &str) -> Result<Option<QueuedJob>, QueueError>;

    /// Remove a finished entry and its claim marker.
    async fn ack(&self, job_id: JobId) -> Result<(), QueueError>;

    /// Drop every claim marker not owned by a periodic job. Returns how many.
    async fn clear_orphaned_claims(&self) -> Result<usize, QueueError>;
}

/// Queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// The queue's backing store could not be reached.
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("queue command failed: {0}")]
    Command(String),
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<String, QueuedJob>,
    /// marker key -> worker
    claims: HashMap<String, String>,
}

/// In-memory queue for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    available: AtomicBool,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Place a claim marker as another (possibly dead) process would.
    pub fn insert_claim_marker(&self, key: impl Into<String>, worker: impl Into<String>) {
        self.lock().claims.insert(key.into(), worker.into());
    }

    pub fn claim_markers(&self) -> HashSet<String> {
        self.lock().claims.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Unavailable("in-memory queue switched off".to_string()))
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn push(&self, job: QueuedJob) -> Result<(), QueueError> {
        self.check_available()?;
        self.lock().entries.insert(job.queue_key(), job);
        Ok(())
    }

    async fn claim(&self, worker: &str) -> Result<Option<QueuedJob>, QueueError> {
        self.check_available()?;
        let now = Utc::now();
        let mut state = self.lock();

        let next = state
            .entries
            .values()
            .filter(|e| e.is_ready(now) && !state.claims.contains_key(&e.queue_key()))
            .min_by_key(|e| (e.ready_at, e.enqueued_at))
            .cloned();

        if let Some(entry) = &next {
            state.claims.insert(entry.queue_key(), worker.to_string());
        }
        Ok(next)
    }

    async fn ack(&self, job_id: JobId) -> Result<(), QueueError> {
        self.check_available()?;
        let key = job_id.to_string();
        let mut state = self.lock();
        state.entries.remove(&key);
        state.claims.remove(&key);
        Ok(())
    }

    async fn clear_orphaned_claims(&self) -> Result<usize, QueueError> {
        self.check_available()?;
        let mut state = self.lock();
        let before = state.claims.len();
        state.claims.retain(|key, _| key.starts_with(CRON_MARKER_PREFIX));
        Ok(before - state.claims.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkwell_core::JobKind;

    fn entry() -> QueuedJob {
        QueuedJob::new(JobId::new(), JobKind::Generation, serde_json::json!({}))
    }

    #[tokio::test]
    async fn push_claim_ack() {
        let queue = InMemoryJobQueue::new();
        let job = entry();
        queue.push(job.clone()).await.unwrap();

        let claimed = queue.claim("w1").await.unwrap().unwrap();
        assert_eq!(claimed.job_id, job.job_id);
        // Claimed entries are hidden from other workers.
        assert!(queue.claim("w2").await.unwrap().is_none());

        queue.ack(job.job_id).await.unwrap();
        assert!(queue.is_empty());
        assert!(queue.claim_markers().is_empty());
    }

    #[tokio::test]
    async fn delayed_entries_are_not_claimable_yet() {
        let queue = InMemoryJobQueue::new();
        let delayed = entry().retry_after(std::time::Duration::from_secs(60));
        queue.push(delayed).await.unwrap();
        assert!(queue.claim("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claims_oldest_ready_entry_first() {
        let queue = InMemoryJobQueue::new();
        let mut first = entry();
        first.ready_at = Utc::now() - chrono::Duration::seconds(10);
        let second = entry();
        queue.push(second.clone()).await.unwrap();
        queue.push(first.clone()).await.unwrap();

        assert_eq!(queue.claim("w").await.unwrap().unwrap().job_id, first.job_id);
        assert_eq!(queue.claim("w").await.unwrap().unwrap().job_id, second.job_id);
    }

    #[tokio::test]
    async fn orphaned_claims_are_cleared_except_cron() {
        let queue = InMemoryJobQueue::new();
        let job = entry();
        queue.push(job.clone()).await.unwrap();
        queue.claim("dead-worker").await.unwrap().unwrap();
        queue.insert_claim_marker("cron:reconcile", "scheduler");

        assert_eq!(queue.clear_orphaned_claims().await.unwrap(), 1);
        assert!(queue.claim_markers().contains("cron:reconcile"));

        // The orphaned entry is claimable again.
        let reclaimed = queue.claim("w2").await.unwrap().unwrap();
        assert_eq!(reclaimed.job_id, job.job_id);
    }

    #[tokio::test]
    async fn unavailable_queue_rejects_push() {
        let queue = InMemoryJobQueue::new();
        queue.set_available(false);
        assert!(matches!(
            queue.push(entry()).await,
            Err(QueueError::Unavailable(_))
        ));
    }
}
