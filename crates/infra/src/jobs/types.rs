//! Queue entries, job outputs and the job-level retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use inkwell_core::{JobId, JobKind, UsageRecord};

/// An entry on the durable queue.
///
/// The queue only carries what a worker needs to run the job; the job record
/// itself lives in the `JobStore`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    /// 1 on first delivery, incremented on each job-level retry
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Not claimable before this instant
    pub ready_at: DateTime<Utc>,
}

impl QueuedJob {
    pub fn new(job_id: JobId, kind: JobKind, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            kind,
            payload,
            attempt: 1,
            enqueued_at: now,
            ready_at: now,
        }
    }

    /// Queue key; also the suffix of the claim marker.
    pub fn queue_key(&self) -> String {
        self.job_id.to_string()
    }

    /// The entry to push for the next job-level attempt.
    pub fn retry_after(&self, delay: Duration) -> Self {
        let mut next = self.clone();
        next.attempt += 1;
        next.ready_at = later_by(Utc::now(), delay);
        next
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.ready_at <= now
    }
}

/// `now + delay`, saturating at the latest representable instant.
pub(crate) fn later_by(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - ttl`, saturating at the Unix epoch.
///
/// A TTL too large to represent means nothing is ever stale.
pub(crate) fn earlier_by(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_sub_signed(ttl))
        .map_or(DateTime::<Utc>::UNIX_EPOCH, |cutoff| cutoff.max(DateTime::<Utc>::UNIX_EPOCH))
}

/// What a handler hands back on success; persisted before the job completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    pub result: serde_json::Value,
    pub usage: Option<UsageRecord>,
    pub cost_usd: Option<f64>,
}

impl JobOutput {
    pub fn new(result: serde_json::Value) -> Self {
        Self {
            result,
            usage: None,
            cost_usd: None,
        }
    }

    pub fn with_usage(mut self, usage: UsageRecord, cost_usd: f64) -> Self {
        self.usage = Some(usage);
        self.cost_usd = Some(cost_usd);
        self
    }
}

/// Fixed-delay, bounded job-level retry.
///
/// A safety net around whole job runs; artifact-level retries happen inside
/// the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Re-runs after the first attempt (0 = no retries)
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::ZERO,
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Whether a job that just failed its `attempt`-th run (1-indexed) may run again.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}
