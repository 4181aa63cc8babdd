//! Background job system: durable queue, job records, worker runtime.
//!
//! ## Design
//!
//! - Job records live in a `JobStore`; the queue only carries what a worker
//!   needs to run them
//! - Workers claim entries with a marker, run them under a timeout, and ack
//! - Retryable failures are re-queued with a fixed delay, up to a retry cap
//! - A reconciler fails jobs whose worker died, by age
//!
//! ## Components
//!
//! - `JobClient`: creates a record and queues it, undoing the record on queue failure
//! - `JobQueue`: durable queue (in-memory or Redis)
//! - `JobStore`: job records and results (in-memory or Postgres)
//! - `WorkerRuntime`: claim loop, handler dispatch, retry and timeout policy
//! - `Reconciler`: periodic stale-job sweep

pub mod client;
pub mod postgres;
pub mod queue;
pub mod reconciler;
#[cfg(feature = "redis")]
pub mod redis_queue;
pub mod runtime;
pub mod store;
pub mod types;

pub use client::{EnqueueError, JobClient};
pub use postgres::PostgresJobStore;
pub use queue::{InMemoryJobQueue, JobQueue, QueueError};
pub use reconciler::{Reconciler, ReconcilerHandle};
#[cfg(feature = "redis")]
pub use redis_queue::RedisJobQueue;
pub use runtime::{
    JobContext, JobError, JobHandler, RunOutcome, RuntimeHandle, StartupError, WorkerRuntime,
};
pub use store::{InMemoryJobStore, JobStore, JobStoreError, STALE_JOB_MESSAGE};
pub use types::{JobOutput, QueuedJob, RetryPolicy};
