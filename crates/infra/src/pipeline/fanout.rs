//! Bounded fan-out of regeneration loops.
//!
//! Every item runs on its own task behind a shared semaphore and reports to
//! a single collector over an `mpsc` channel. Items complete in any order;
//! the final report is keyed by item index and re-sorted. A panicking item
//! becomes an error artifact; it never takes its siblings down. Dropping a
//! `FanOut` aborts every item still running.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{error, info};

use inkwell_core::{Artifact, IssueCategory, Verdict};

/// One unit of work for the pool.
#[derive(Debug, Clone)]
pub struct FanOutItem<I> {
    pub index: usize,
    pub key: String,
    pub input: I,
}

/// Progress notification emitted as each item finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOutTick {
    pub index: usize,
    pub completed: usize,
    pub total: usize,
    pub accepted: bool,
}

/// Aggregate quality counters for one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Content without a verdict (no judge, or the judge errored)
    pub unjudged: usize,
    pub failures_by_category: BTreeMap<IssueCategory, usize>,
    pub total_attempts: u32,
    pub regenerations: u32,
    /// Items whose last attempt raised
    pub errors: usize,
}

impl QaSummary {
    pub fn from_artifacts(artifacts: &[Artifact]) -> Self {
        let mut summary = QaSummary {
            total: artifacts.len(),
            ..Default::default()
        };
        for artifact in artifacts {
            match artifact.verdict {
                Verdict::Pass => summary.passed += 1,
                Verdict::Fail => {
                    summary.failed += 1;
                    for issue in &artifact.issues {
                        *summary.failures_by_category.entry(issue.category).or_default() += 1;
                    }
                }
                Verdict::Pending if artifact.has_content() => summary.unjudged += 1,
                Verdict::Pending => {}
            }
            summary.total_attempts += artifact.attempt;
            summary.regenerations += artifact.regenerations();
            if artifact.error.is_some() {
                summary.errors += 1;
            }
        }
        summary
    }
}

/// Artifacts of a finished fan-out, in index order, plus their summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutReport {
    pub artifacts: Vec<Artifact>,
    pub summary: QaSummary,
}

struct Completion {
    index: usize,
    key: String,
    result: Result<Artifact, String>,
}

/// A running fan-out. Drive with `next`, then collect with `finish`.
pub struct FanOut {
    rx: mpsc::UnboundedReceiver<Completion>,
    pending: BTreeMap<usize, String>,
    done: BTreeMap<usize, Artifact>,
    total: usize,
    // Owns the item tasks; dropped (and aborted) with the fan-out.
    tasks: JoinSet<()>,
}

/// Spawn one task per item, at most `max_concurrency` running at once.
///
/// Must be called within a tokio runtime.
pub fn spawn<I, F, Fut>(items: Vec<FanOutItem<I>>, worker: F, max_concurrency: usize) -> FanOut
where
    I: Send + 'static,
    F: Fn(usize, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Artifact> + Send + 'static,
{
    let total = items.len();
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let worker = Arc::new(worker);
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = items.iter().map(|item| (item.index, item.key.clone())).collect();
    let mut tasks = JoinSet::new();

    for item in items {
        let semaphore = semaphore.clone();
        let worker = worker.clone();
        let tx = tx.clone();

        tasks.spawn(async move {
            let FanOutItem { index, key, input } = item;
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => AssertUnwindSafe(worker(index, input))
                    .catch_unwind()
                    .await
                    .map_err(|panic| panic_message(panic.as_ref())),
                Err(_) => Err("fan-out pool closed".to_string()),
            };
            let _ = tx.send(Completion { index, key, result });
        });
    }

    FanOut {
        rx,
        pending,
        done: BTreeMap::new(),
        total,
        tasks,
    }
}

/// Run every item to completion and return the merged report.
pub async fn run_all<I, F, Fut>(items: Vec<FanOutItem<I>>, worker: F, max_concurrency: usize) -> FanOutReport
where
    I: Send + 'static,
    F: Fn(usize, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Artifact> + Send + 'static,
{
    spawn(items, worker, max_concurrency).finish().await
}

impl FanOut {
    pub fn total(&self) -> usize {
        self.total
    }

    /// Wait for the next item to finish. `None` once all items reported.
    pub async fn next(&mut self) -> Option<FanOutTick> {
        if self.pending.is_empty() {
            return None;
        }
        let Completion { index, key, result } = self.rx.recv().await?;
        self.pending.remove(&index);

        let artifact = match result {
            Ok(artifact) => artifact,
            Err(message) => {
                error!(index, key = %key, panic = %message, "fan-out item panicked");
                failed_artifact(index, key, format!("worker panicked: {message}"))
            }
        };
        let accepted = artifact.accepted;
        self.done.insert(index, artifact);

        Some(FanOutTick {
            index,
            completed: self.done.len(),
            total: self.total,
            accepted,
        })
    }

    /// Drain the remaining items and merge everything by index.
    pub async fn finish(mut self) -> FanOutReport {
        while self.next().await.is_some() {}

        // Tasks that vanished without reporting (runtime shutting down).
        for (index, key) in std::mem::take(&mut self.pending) {
            self.done
                .insert(index, failed_artifact(index, key, "worker exited without a result".to_string()));
        }

        let artifacts: Vec<Artifact> = self.done.into_values().collect();
        let summary = QaSummary::from_artifacts(&artifacts);
        info!(
            total = summary.total,
            passed = summary.passed,
            failed = summary.failed,
            regenerations = summary.regenerations,
            errors = summary.errors,
            "fan-out finished"
        );
        FanOutReport { artifacts, summary }
    }
}

fn failed_artifact(index: usize, key: String, message: String) -> Artifact {
    let mut artifact = Artifact::new(index, key, 0);
    artifact.error = Some(message);
    artifact
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
