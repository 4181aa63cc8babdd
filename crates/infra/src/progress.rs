//! Debounced, monotonic progress reporting for one job.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use inkwell_core::{JobId, ProgressRecord, Stage};

use crate::jobs::JobStore;

/// Latest progress of one run, held back or not.
///
/// Shared between a run's reporter and the runtime, so the runtime can write
/// a terminal record after the handler is gone.
#[derive(Debug, Clone, Default)]
pub struct LatestProgress {
    inner: Arc<Mutex<Option<ProgressRecord>>>,
}

impl LatestProgress {
    pub fn get(&self) -> Option<ProgressRecord> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set(&self, record: &ProgressRecord) {
        *self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(record.clone());
    }
}

/// `previous` moved to `stage`, keeping its percentage, counters and warnings.
pub fn carry_forward(previous: Option<ProgressRecord>, stage: Stage, detail: impl Into<String>) -> ProgressRecord {
    let stage_detail = detail.into();
    match previous {
        Some(previous) => ProgressRecord {
            stage,
            stage_detail,
            updated_at: Utc::now(),
            ..previous
        },
        None => ProgressRecord {
            stage,
            stage_detail,
            percentage: stage.percentage(None, None).unwrap_or(0),
            completed: None,
            total: None,
            warnings: Vec::new(),
            updated_at: Utc::now(),
        },
    }
}

/// Single writer of a job's progress record.
///
/// Writes are rate limited: an update within `min_interval` of the previous
/// write is held back unless it changes stage or completes the stage. Held
/// updates are written by the next forced write (`flush`, `finish`).
/// Store failures are logged and swallowed; progress never fails a job.
pub struct ProgressReporter {
    job_id: JobId,
    store: Arc<dyn JobStore>,
    min_interval: Duration,
    current: Option<ProgressRecord>,
    last_written_pct: u8,
    last_write: Option<Instant>,
    warnings: Vec<String>,
    dirty: bool,
    latest: LatestProgress,
}

impl ProgressReporter {
    pub fn new(job_id: JobId, store: Arc<dyn JobStore>, min_interval: Duration) -> Self {
        Self {
            job_id,
            store,
            min_interval,
            current: None,
            last_written_pct: 0,
            last_write: None,
            warnings: Vec::new(),
            dirty: false,
            latest: LatestProgress::default(),
        }
    }

    /// Mirror every update, written or held back, into `latest`.
    pub fn with_latest(mut self, latest: LatestProgress) -> Self {
        self.latest = latest;
        self
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Latest record, written or held back.
    pub fn current(&self) -> Option<&ProgressRecord> {
        self.current.as_ref()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Report `(stage, detail, completed, total)`. Returns true if written.
    pub async fn update(
        &mut self,
        stage: Stage,
        detail: impl Into<String>,
        completed: Option<u32>,
        total: Option<u32>,
    ) -> bool {
        let stage_changed = self.current.as_ref().map(|r| r.stage) != Some(stage);
        let stage_done = matches!((completed, total), (Some(c), Some(t)) if c >= t);
        let within_window = self
            .last_write
            .is_some_and(|at| at.elapsed() < self.min_interval);

        self.current = Some(self.record(stage, detail.into(), completed, total));
        self.dirty = true;

        if !stage_changed && !stage_done && within_window {
            self.mirror();
            debug!(job_id = %self.job_id, stage = %stage, "progress update debounced");
            return false;
        }
        self.write().await
    }

    /// Append a non-fatal warning. Persisted with the next write.
    pub fn add_warning(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(job_id = %self.job_id, warning = %message, "job warning");
        self.warnings.push(message);
        if let Some(record) = self.current.as_mut() {
            record.warnings = self.warnings.clone();
        }
        self.dirty = true;
        self.mirror();
    }

    /// Write any held-back update now.
    pub async fn flush(&mut self) -> bool {
        if !self.dirty {
            return false;
        }
        self.write().await
    }

    /// Terminal update; always written.
    pub async fn finish(&mut self, stage: Stage, detail: impl Into<String>) -> bool {
        let (completed, total) = self
            .current
            .as_ref()
            .map(|r| (r.completed, r.total))
            .unwrap_or((None, None));
        self.current = Some(self.record(stage, detail.into(), completed, total));
        self.dirty = true;
        self.write().await
    }

    fn record(
        &self,
        stage: Stage,
        stage_detail: String,
        completed: Option<u32>,
        total: Option<u32>,
    ) -> ProgressRecord {
        let floor = self
            .current
            .as_ref()
            .map(|r| r.percentage)
            .unwrap_or(0)
            .max(self.last_written_pct);
        let percentage = stage
            .percentage(completed, total)
            .map_or(floor, |p| p.max(floor));

        ProgressRecord {
            stage,
            stage_detail,
            percentage,
            completed,
            total,
            warnings: self.warnings.clone(),
            updated_at: Utc::now(),
        }
    }

    fn mirror(&self) {
        if let Some(record) = self.current.as_ref() {
            self.latest.set(record);
        }
    }

    async fn write(&mut self) -> bool {
        let Some(record) = self.current.as_mut() else {
            return false;
        };
        record.warnings = self.warnings.clone();
        record.updated_at = Utc::now();
        self.latest.set(record);

        self.last_write = Some(Instant::now());
        self.dirty = false;
        self.last_written_pct = record.percentage;

        match self.store.update_progress(self.job_id, record).await {
            Ok(()) => {
                debug!(
                    job_id = %self.job_id,
                    stage = %record.stage,
                    percentage = record.percentage,
                    "progress written"
                );
                true
            }
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "failed to write progress");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::InMemoryJobStore;
    use inkwell_core::{Job, JobKind};

    async fn reporter(interval: Duration) -> (Arc<InMemoryJobStore>, ProgressReporter) {
        let store = InMemoryJobStore::arc();
        let job_id = store
            .create(Job::new(JobKind::Generation, serde_json::json!({})))
            .await
            .unwrap();
        let reporter = ProgressReporter::new(job_id, store.clone(), interval);
        (store, reporter)
    }

    async fn persisted(store: &InMemoryJobStore, job_id: JobId) -> ProgressRecord {
        store.get(job_id).await.unwrap().unwrap().progress.unwrap()
    }

    #[tokio::test]
    async fn same_stage_updates_inside_window_are_debounced() {
        let (store, mut reporter) = reporter(Duration::from_secs(60)).await;

        assert!(reporter.update(Stage::Illustrations, "illustrating", Some(0), Some(12)).await);
        assert!(!reporter.update(Stage::Illustrations, "illustrating", Some(3), Some(12)).await);
        assert_eq!(persisted(&store, reporter.job_id()).await.percentage, 40);

        // stage completion always writes
        assert!(reporter.update(Stage::Illustrations, "illustrating", Some(12), Some(12)).await);
        assert_eq!(persisted(&store, reporter.job_id()).await.percentage, 100);
    }

    #[tokio::test]
    async fn stage_change_writes_through_window() {
        let (store, mut reporter) = reporter(Duration::from_secs(60)).await;

        reporter.update(Stage::Text, "writing", None, None).await;
        assert!(reporter.update(Stage::References, "references", Some(0), Some(3)).await);
        let record = persisted(&store, reporter.job_id()).await;
        assert_eq!(record.stage, Stage::References);
        assert_eq!(record.percentage, 15);
    }

    #[tokio::test]
    async fn flush_writes_held_update() {
        let (store, mut reporter) = reporter(Duration::from_secs(60)).await;

        reporter.update(Stage::Illustrations, "illustrating", Some(0), Some(12)).await;
        reporter.update(Stage::Illustrations, "illustrating", Some(6), Some(12)).await;
        assert!(reporter.flush().await);
        assert_eq!(persisted(&store, reporter.job_id()).await.percentage, 70);
        assert!(!reporter.flush().await);
    }

    #[tokio::test]
    async fn percentage_never_goes_backwards() {
        let (store, mut reporter) = reporter(Duration::ZERO).await;

        reporter.update(Stage::Illustrations, "illustrating", Some(6), Some(12)).await;
        reporter.update(Stage::References, "late reference", Some(0), Some(3)).await;
        assert_eq!(persisted(&store, reporter.job_id()).await.percentage, 70);

        reporter.finish(Stage::Failed, "boom").await;
        let record = persisted(&store, reporter.job_id()).await;
        assert_eq!(record.stage, Stage::Failed);
        assert_eq!(record.percentage, 70);
    }

    #[tokio::test]
    async fn warnings_are_appended_and_persisted() {
        let (store, mut reporter) = reporter(Duration::ZERO).await;

        reporter.update(Stage::References, "references", Some(0), Some(2)).await;
        reporter.add_warning("reference 'fox' has no content");
        reporter.add_warning("illustration 7 failed quality checks");
        reporter.flush().await;

        let record = persisted(&store, reporter.job_id()).await;
        assert_eq!(record.warnings.len(), 2);
        assert_eq!(reporter.warnings()[0], "reference 'fox' has no content");
    }

    #[tokio::test]
    async fn latest_sees_held_back_updates() {
        let (store, reporter) = reporter(Duration::from_secs(60)).await;
        let latest = LatestProgress::default();
        let mut reporter = reporter.with_latest(latest.clone());

        reporter.update(Stage::Illustrations, "illustrating", Some(0), Some(12)).await;
        assert!(!reporter.update(Stage::Illustrations, "illustrating", Some(6), Some(12)).await);
        reporter.add_warning("illustration 2 failed after 3 attempts");

        assert_eq!(persisted(&store, reporter.job_id()).await.percentage, 40);
        let held = latest.get().unwrap();
        assert_eq!(held.percentage, 70);
        assert_eq!(held.warnings, vec!["illustration 2 failed after 3 attempts".to_string()]);
    }

    #[test]
    fn carry_forward_keeps_percentage_and_warnings() {
        let previous = ProgressRecord {
            stage: Stage::Illustrations,
            stage_detail: "illustrating".into(),
            percentage: 70,
            completed: Some(6),
            total: Some(12),
            warnings: vec!["reference 'fox' has no content".into()],
            updated_at: Utc::now(),
        };

        let failed = carry_forward(Some(previous), Stage::Failed, "job timed out after 600s");
        assert_eq!(failed.stage, Stage::Failed);
        assert_eq!(failed.stage_detail, "job timed out after 600s");
        assert_eq!(failed.percentage, 70);
        assert_eq!(failed.completed, Some(6));
        assert_eq!(failed.warnings.len(), 1);

        let fresh = carry_forward(None, Stage::Failed, "no handler");
        assert_eq!(fresh.percentage, 0);
        assert!(fresh.warnings.is_empty());
    }

    #[tokio::test]
    async fn store_failure_is_swallowed() {
        let (store, mut reporter) = reporter(Duration::ZERO).await;
        store.set_available(false);

        assert!(!reporter.update(Stage::Text, "writing", None, None).await);
        assert!(!reporter.finish(Stage::Complete, "done").await);
        assert_eq!(reporter.current().unwrap().percentage, 100);
    }
}
