//! Infrastructure layer: job queue, job store, worker runtime and the
//! generation pipeline that runs inside it.

pub mod config;
pub mod jobs;
pub mod pipeline;
pub mod progress;
pub mod usage;

pub use config::{Config, PipelineConfig, ReconcileConfig, WorkerConfig};
pub use progress::{LatestProgress, ProgressReporter, carry_forward};
pub use usage::UsageAccumulator;

#[cfg(test)]
mod testing;
