//! Job state storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use inkwell_core::{Job, JobId, JobStatus, JobTransition, ProgressRecord};

use super::types::JobOutput;

/// Error message written onto jobs the reconciler reclaims.
pub const STALE_JOB_MESSAGE: &str = "stale job reclaimed";

/// Persisted job records.
///
/// Status and timestamps are last-write-wins; `Job::apply` keeps the
/// timestamp invariants on every write.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new (pending) job.
    async fn create(&self, job: Job) -> Result<JobId, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Remove a job record entirely (enqueue compensation).
    async fn delete(&self, job_id: JobId) -> Result<(), JobStoreError>;

    /// Apply a status transition and return the updated record.
    async fn transition(&self, job_id: JobId, transition: JobTransition) -> Result<Job, JobStoreError>;

    /// Overwrite the job's progress blob.
    async fn update_progress(&self, job_id: JobId, progress: &ProgressRecord) -> Result<(), JobStoreError>;

    /// Persist a handler's output; returns the reference to complete the job with.
    async fn save_output(&self, job_id: JobId, output: &JobOutput) -> Result<String, JobStoreError>;

    async fn load_output(&self, result_ref: &str) -> Result<Option<serde_json::Value>, JobStoreError>;

    /// Fail every pending job older than `pending_ttl` and every running job
    /// older than `running_ttl` at `now`. Returns how many were reclaimed.
    async fn sweep(
        &self,
        pending_ttl: Duration,
        running_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, JobStoreError>;

    /// Jobs with `status`, oldest first.
    async fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    /// The backing store could not be reached.
    #[error("job store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

fn result_ref_for(job_id: JobId) -> String {
    format!("result:{job_id}")
}

/// In-memory job store for tests/dev.
///
/// Can be switched unavailable to exercise infrastructure failures.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    results: RwLock<HashMap<String, serde_json::Value>>,
    available: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            results: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), JobStoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(JobStoreError::Unavailable("in-memory store switched off".to_string()))
        }
    }

    fn read_jobs(&self) -> RwLockReadGuard<'_, HashMap<JobId, Job>> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_jobs(&self) -> RwLockWriteGuard<'_, HashMap<JobId, Job>> {
        self.jobs.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: Job) -> Result<JobId, JobStoreError> {
        self.check_available()?;
        let mut jobs = self.write_jobs();
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.check_available()?;
        Ok(self.read_jobs().get(&job_id).cloned())
    }

    async fn delete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        self.check_available()?;
        self.write_jobs().remove(&job_id);
        self.results
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&result_ref_for(job_id));
        Ok(())
    }

    async fn transition(&self, job_id: JobId, transition: JobTransition) -> Result<Job, JobStoreError> {
        self.check_available()?;
        let mut jobs = self.write_jobs();
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        job.apply(transition);
        Ok(job.clone())
    }

    async fn update_progress(&self, job_id: JobId, progress: &ProgressRecord) -> Result<(), JobStoreError> {
        self.check_available()?;
        let mut jobs = self.write_jobs();
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        job.progress = Some(progress.clone());
        Ok(())
    }

    async fn save_output(&self, job_id: JobId, output: &JobOutput) -> Result<String, JobStoreError> {
        self.check_available()?;
        let result_ref = result_ref_for(job_id);
        {
            let mut jobs = self.write_jobs();
            let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
            job.usage = output.usage.clone();
            job.cost_usd = output.cost_usd;
        }
        self.results
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(result_ref.clone(), output.result.clone());
        Ok(result_ref)
    }

    async fn load_output(&self, result_ref: &str) -> Result<Option<serde_json::Value>, JobStoreError> {
        self.check_available()?;
        Ok(self
            .results
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(result_ref)
            .cloned())
    }

    async fn sweep(
        &self,
        pending_ttl: Duration,
        running_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, JobStoreError> {
        self.check_available()?;
        let mut jobs = self.write_jobs();
        let mut reclaimed = 0;
        for job in jobs.values_mut() {
            if job.is_stale(pending_ttl, running_ttl, now) {
                job.apply(JobTransition::fail(now, STALE_JOB_MESSAGE));
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.check_available()?;
        let jobs = self.read_jobs();
        let mut result: Vec<_> = jobs.values().filter(|j| j.status == status).cloned().collect();
        result.sort_by_key(|j| j.created_at);
        result.truncate(limit);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkwell_core::{JobKind, Stage};

    fn test_job() -> Job {
        Job::new(JobKind::Generation, serde_json::json!({"brief": "a fox"}))
    }

    #[tokio::test]
    async fn create_and_transition() {
        let store = InMemoryJobStore::new();
        let job_id = store.create(test_job()).await.unwrap();

        let running = store.transition(job_id, JobTransition::start(Utc::now())).await.unwrap();
        assert_eq!(running.status, JobStatus::Running);

        let output = JobOutput::new(serde_json::json!({"title": "Fox"}));
        let result_ref = store.save_output(job_id, &output).await.unwrap();
        let done = store
            .transition(job_id, JobTransition::complete(Utc::now(), result_ref.clone()))
            .await
            .unwrap();

        assert_eq!(done.status, JobStatus::Completed);
        done.check_invariants().unwrap();
        assert_eq!(
            store.load_output(&result_ref).await.unwrap(),
            Some(serde_json::json!({"title": "Fox"}))
        );
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = InMemoryJobStore::new();
        let job = test_job();
        store.create(job.clone()).await.unwrap();
        assert!(matches!(
            store.create(job).await,
            Err(JobStoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn transition_of_unknown_job_is_not_found() {
        let store = InMemoryJobStore::new();
        let err = store
            .transition(JobId::new(), JobTransition::start(Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn sweep_reclaims_stale_jobs_once() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let pending_ttl = Duration::from_secs(120);
        let running_ttl = Duration::from_secs(720);

        let old_pending = store
            .create(test_job().with_created_at(now - chrono::Duration::seconds(200)))
            .await
            .unwrap();
        let fresh_pending = store.create(test_job().with_created_at(now)).await.unwrap();
        let old_running = store
            .create(test_job().with_created_at(now - chrono::Duration::seconds(900)))
            .await
            .unwrap();
        store
            .transition(old_running, JobTransition::start(now - chrono::Duration::seconds(800)))
            .await
            .unwrap();

        assert_eq!(store.sweep(pending_ttl, running_ttl, now).await.unwrap(), 2);
        assert_eq!(store.sweep(pending_ttl, running_ttl, now).await.unwrap(), 0);

        for id in [old_pending, old_running] {
            let job = store.get(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.error_message.as_deref(), Some(STALE_JOB_MESSAGE));
            job.check_invariants().unwrap();
        }
        let fresh = store.get(fresh_pending).await.unwrap().unwrap();
        assert_eq!(fresh.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn progress_is_overwritten() {
        let store = InMemoryJobStore::new();
        let job_id = store.create(test_job()).await.unwrap();
        let mut record = ProgressRecord {
            stage: Stage::Text,
            stage_detail: "drafting".into(),
            percentage: 0,
            completed: None,
            total: None,
            warnings: vec![],
            updated_at: Utc::now(),
        };
        store.update_progress(job_id, &record).await.unwrap();
        record.stage = Stage::References;
        record.percentage = 15;
        store.update_progress(job_id, &record).await.unwrap();

        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.progress.unwrap().stage, Stage::References);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryJobStore::new();
        store.set_available(false);
        assert!(matches!(
            store.create(test_job()).await,
            Err(JobStoreError::Unavailable(_))
        ));
        assert!(matches!(
            store.sweep(Duration::ZERO, Duration::ZERO, Utc::now()).await,
            Err(JobStoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn list_by_status_is_oldest_first() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let newer = store.create(test_job().with_created_at(now)).await.unwrap();
        let older = store
            .create(test_job().with_created_at(now - chrono::Duration::seconds(5)))
            .await
            .unwrap();

        let pending = store.list_by_status(JobStatus::Pending, 10).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![older, newer]);
    }
}
