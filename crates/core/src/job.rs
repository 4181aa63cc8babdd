//! Job record and lifecycle transitions.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::progress::ProgressRecord;
use crate::usage::UsageRecord;

/// What a job does; used to route it to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Full pipeline run: text, references, illustrations.
    Generation,
    /// Re-run of a single illustration unit.
    Regeneration,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Generation => "generation",
            JobKind::Regeneration => "regeneration",
        }
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generation" => Ok(JobKind::Generation),
            "regeneration" => Ok(JobKind::Regeneration),
            other => Err(DomainError::validation(format!("unknown job kind: {other}"))),
        }
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Enqueued, not yet claimed by a worker
    Pending,
    /// Claimed and executing (also between job-level retries)
    Running,
    /// Finished with a result
    Completed,
    /// Finished without a result
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// A status change, carrying the timestamps it stamps onto the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobTransition {
    Start {
        at: DateTime<Utc>,
    },
    Complete {
        at: DateTime<Utc>,
        result_ref: String,
    },
    Fail {
        at: DateTime<Utc>,
        error: String,
    },
}

impl JobTransition {
    pub fn start(at: DateTime<Utc>) -> Self {
        Self::Start { at }
    }

    pub fn complete(at: DateTime<Utc>, result_ref: impl Into<String>) -> Self {
        Self::Complete {
            at,
            result_ref: result_ref.into(),
        }
    }

    pub fn fail(at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self::Fail {
            at,
            error: error.into(),
        }
    }

    /// Status the job ends up in after this transition.
    pub fn target(&self) -> JobStatus {
        match self {
            JobTransition::Start { .. } => JobStatus::Running,
            JobTransition::Complete { .. } => JobStatus::Completed,
            JobTransition::Fail { .. } => JobStatus::Failed,
        }
    }
}

/// A durable, tracked unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Opaque handler input given at enqueue time
    pub payload: serde_json::Value,
    /// Number of times a worker started this job
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Reference to the persisted output; set iff completed
    pub result_ref: Option<String>,
    pub progress: Option<ProgressRecord>,
    pub usage: Option<UsageRecord>,
    pub cost_usd: Option<f64>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(kind: JobKind, payload: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            kind,
            status: JobStatus::Pending,
            payload,
            attempt: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            result_ref: None,
            progress: None,
            usage: None,
            cost_usd: None,
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Apply a status change.
    ///
    /// Last write wins: any transition is accepted from any status, and the
    /// timestamp invariants are re-established afterwards. A `Fail` on a job
    /// that never started stamps `started_at` with the failure time; a
    /// terminal timestamp never precedes `started_at`.
    pub fn apply(&mut self, transition: JobTransition) {
        match transition {
            JobTransition::Start { at } => {
                self.status = JobStatus::Running;
                self.attempt += 1;
                self.started_at = Some(at);
                self.completed_at = None;
                self.error_message = None;
                self.result_ref = None;
            }
            JobTransition::Complete { at, result_ref } => {
                let started = *self.started_at.get_or_insert(at);
                self.status = JobStatus::Completed;
                self.completed_at = Some(at.max(started));
                self.error_message = None;
                self.result_ref = Some(result_ref);
            }
            JobTransition::Fail { at, error } => {
                let started = *self.started_at.get_or_insert(at);
                self.status = JobStatus::Failed;
                self.completed_at = Some(at.max(started));
                self.error_message = Some(error);
                self.result_ref = None;
            }
        }
    }

    /// Verify the timestamp invariants.
    pub fn check_invariants(&self) -> DomainResult<()> {
        let pending = self.status == JobStatus::Pending;
        if pending == self.started_at.is_some() {
            return Err(DomainError::invariant(format!(
                "job {}: started_at must be set iff status is not pending (status={})",
                self.id, self.status
            )));
        }
        if self.status.is_terminal() != self.completed_at.is_some() {
            return Err(DomainError::invariant(format!(
                "job {}: completed_at must be set iff status is terminal (status={})",
                self.id, self.status
            )));
        }
        if let (Some(started), Some(completed)) = (self.started_at, self.completed_at) {
            if completed < started {
                return Err(DomainError::invariant(format!(
                    "job {}: completed_at precedes started_at",
                    self.id
                )));
            }
        }
        if (self.status == JobStatus::Completed) != self.result_ref.is_some() {
            return Err(DomainError::invariant(format!(
                "job {}: result_ref must be set iff completed",
                self.id
            )));
        }
        Ok(())
    }

    /// Whether the reconciler should reclaim this job at `now`.
    ///
    /// Pending age counts from `created_at`, running age from `started_at`.
    /// Terminal jobs are never stale.
    pub fn is_stale(&self, pending_ttl: Duration, running_ttl: Duration, now: DateTime<Utc>) -> bool {
        let (since, ttl) = match self.status {
            JobStatus::Pending => (self.created_at, pending_ttl),
            JobStatus::Running => (self.started_at.unwrap_or(self.created_at), running_ttl),
            JobStatus::Completed | JobStatus::Failed => return false,
        };
        // A negative age (clock skew) is not stale.
        (now - since).to_std().map(|age| age > ttl).unwrap_or(false)
    }
}
