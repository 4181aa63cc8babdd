//! `inkwell-core`: generation job domain building blocks.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! the job record and its lifecycle, progress snapshots, usage counters and
//! the per-artifact outcome produced by the generation pipeline.

pub mod artifact;
pub mod error;
pub mod id;
pub mod job;
pub mod progress;
pub mod usage;

pub use artifact::{Artifact, Issue, IssueCategory, Verdict};
pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{Job, JobKind, JobStatus, JobTransition};
pub use progress::{ProgressRecord, Stage};
pub use usage::{ModelUnits, UsageRecord};
