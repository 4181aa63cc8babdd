//! Redis-backed durable job queue.
//!
//! ## Layout
//!
//! - **Queue**: `{prefix}:queue`, a sorted set of job ids scored by ready time (ms)
//! - **Entries**: `{prefix}:job:{id}`, the JSON-encoded `QueuedJob`
//! - **Claims**: `{prefix}:in-progress:{id}`, set with `NX` and a TTL when a worker claims
//!
//! A claimed id stays in the sorted set until `ack`, so a worker that dies
//! leaves only its claim marker behind. Startup cleanup deletes those markers
//! (except `cron:` ones) and the entries become claimable again. Because
//! claimed ids stay at the head of the set, `claim` pages past them until it
//! finds an unclaimed id or runs out of ready ones.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use tracing::{debug, instrument};

use inkwell_core::JobId;

use super::queue::{CRON_MARKER_PREFIX, JobQueue, QueueError};
use super::types::QueuedJob;

/// Default key prefix
const DEFAULT_PREFIX: &str = "inkwell";

/// Candidates fetched per page while claiming
const CLAIM_BATCH: usize = 16;

/// Position of a claim scan over the ready part of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct ClaimScan {
    offset: usize,
}

impl ClaimScan {
    /// Move past a page of `fetched` ids, `removed` of which were dropped
    /// from the set. `None` once a short page shows the set is exhausted.
    fn advance(self, fetched: usize, removed: usize) -> Option<Self> {
        if fetched < CLAIM_BATCH {
            return None;
        }
        Some(Self {
            offset: self.offset + fetched - removed.min(fetched),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RedisJobQueue {
    client: Arc<redis::Client>,
    prefix: String,
    /// Lifetime of a claim marker; should exceed the job timeout
    claim_ttl: Duration,
}

impl RedisJobQueue {
    /// Create a queue on `redis_url` (e.g. "redis://localhost:6379").
    pub fn new(redis_url: impl AsRef<str>, claim_ttl: Duration) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            prefix: DEFAULT_PREFIX.to_string(),
            claim_ttl,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn queue_key(&self) -> String {
        format!("{}:queue", self.prefix)
    }

    fn entry_key(&self, id: &str) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn claim_key(&self, id: &str) -> String {
        format!("{}:in-progress:{}", self.prefix, id)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))
    }
}

fn command_error(op: &str, err: redis::RedisError) -> QueueError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        QueueError::Unavailable(format!("{op}: {err}"))
    } else {
        QueueError::Command(format!("{op} failed: {err}"))
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    #[instrument(skip(self, job), fields(job_id = %job.job_id, attempt = job.attempt), err)]
    async fn push(&self, job: QueuedJob) -> Result<(), QueueError> {
        let payload =
            serde_json::to_string(&job).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let id = job.queue_key();
        let mut conn = self.connection().await?;

        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.entry_key(&id))
            .arg(&payload)
            .ignore()
            .cmd("ZADD")
            .arg(self.queue_key())
            .arg(job.ready_at.timestamp_millis())
            .arg(&id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| command_error("push", e))
    }

    #[instrument(skip(self), err)]
    async fn claim(&self, worker: &str) -> Result<Option<QueuedJob>, QueueError> {
        let mut conn = self.connection().await?;
        let now_ms = Utc::now().timestamp_millis();

        let mut scan = ClaimScan::default();
        loop {
            let candidates: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(self.queue_key())
                .arg("-inf")
                .arg(now_ms)
                .arg("LIMIT")
                .arg(scan.offset)
                .arg(CLAIM_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| command_error("ZRANGEBYSCORE", e))?;

            let fetched = candidates.len();
            let mut removed = 0;
            for id in candidates {
                let claimed: Option<String> = redis::cmd("SET")
                    .arg(self.claim_key(&id))
                    .arg(worker)
                    .arg("NX")
                    .arg("PX")
                    .arg(self.claim_ttl.as_millis() as u64)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| command_error("SET NX", e))?;
                if claimed.is_none() {
                    continue;
                }

                let payload: Option<String> = redis::cmd("GET")
                    .arg(self.entry_key(&id))
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| command_error("GET", e))?;

                let Some(payload) = payload else {
                    // Entry vanished (acked elsewhere); drop the dangling id.
                    debug!(queue_id = %id, "queue id without entry");
                    redis::pipe()
                        .cmd("ZREM")
                        .arg(self.queue_key())
                        .arg(&id)
                        .ignore()
                        .cmd("DEL")
                        .arg(self.claim_key(&id))
                        .ignore()
                        .query_async::<_, ()>(&mut conn)
                        .await
                        .map_err(|e| command_error("cleanup", e))?;
                    removed += 1;
                    continue;
                };

                let job: QueuedJob = serde_json::from_str(&payload)
                    .map_err(|e| QueueError::Serialization(e.to_string()))?;
                return Ok(Some(job));
            }

            match scan.advance(fetched, removed) {
                Some(next) => scan = next,
                None => break,
            }
        }

        Ok(None)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn ack(&self, job_id: JobId) -> Result<(), QueueError> {
        let id = job_id.to_string();
        let mut conn = self.connection().await?;

        redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(self.queue_key())
            .arg(&id)
            .ignore()
            .cmd("DEL")
            .arg(self.entry_key(&id))
            .arg(self.claim_key(&id))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| command_error("ack", e))
    }

    #[instrument(skip(self), err)]
    async fn clear_orphaned_claims(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let pattern = self.claim_key("*");
        let cron_prefix = self.claim_key(CRON_MARKER_PREFIX);

        let mut cursor: u64 = 0;
        let mut orphaned: Vec<String> = Vec::new();
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| command_error("SCAN", e))?;
            orphaned.extend(keys.into_iter().filter(|k| !k.starts_with(&cron_prefix)));
            if next == 0 {
                break;
            }
            cursor = next;
        }

        if orphaned.is_empty() {
            return Ok(0);
        }

        let deleted: usize = redis::cmd("DEL")
            .arg(&orphaned)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("DEL", e))?;
        Ok(deleted)
    }
}
