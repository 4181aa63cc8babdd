//! Postgres-backed job store.
//!
//! One row per job in `generation_jobs`; progress, usage and the handler
//! result are JSONB columns on the same row.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | Database (unique violation `23505`) | `AlreadyExists` |
//! | Io / PoolTimedOut / PoolClosed | `Unavailable` |
//! | Anything else | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{Span, instrument};

use inkwell_core::{
    Job, JobId, JobKind, JobStatus, JobTransition, ProgressRecord, UsageRecord,
};

use super::store::{JobStore, JobStoreError, STALE_JOB_MESSAGE};
use super::types::{JobOutput, earlier_by};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS generation_jobs (
    id              UUID PRIMARY KEY,
    kind            TEXT NOT NULL,
    status          TEXT NOT NULL,
    payload         JSONB NOT NULL DEFAULT '{}'::jsonb,
    attempt         INTEGER NOT NULL DEFAULT 0,
    created_at      TIMESTAMPTZ NOT NULL,
    started_at      TIMESTAMPTZ,
    completed_at    TIMESTAMPTZ,
    error_message   TEXT,
    result_ref      TEXT,
    progress        JSONB,
    usage           JSONB,
    cost_usd        DOUBLE PRECISION,
    result          JSONB
);
CREATE INDEX IF NOT EXISTS generation_jobs_status_created_idx
    ON generation_jobs (status, created_at);
"#;

const JOB_COLUMNS: &str = "id, kind, status, payload, attempt, created_at, started_at, \
     completed_at, error_message, result_ref, progress, usage, cost_usd";

/// Postgres-backed job store.
///
/// `Send + Sync`; all calls go through the shared SQLx pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect to `database_url` with a small default pool.
    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the jobs table and index if missing.
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn write_job(
        executor: impl sqlx::PgExecutor<'_>,
        job: &Job,
    ) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = $2, attempt = $3, started_at = $4, completed_at = $5,
                error_message = $6, result_ref = $7
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.attempt as i32)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.error_message.as_deref())
        .bind(job.result_ref.as_deref())
        .execute(executor)
        .await
        .map_err(|e| map_sqlx_error("write_job", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, kind = %job.kind), err)]
    async fn create(&self, job: Job) -> Result<JobId, JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO generation_jobs (id, kind, status, payload, attempt, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.kind.as_str())
        .bind(job.status.as_str())
        .bind(Json(&job.payload))
        .bind(job.attempt as i32)
        .bind(job.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("create", e)
            }
        })?;
        Ok(job.id)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM generation_jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn delete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        sqlx::query("DELETE FROM generation_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(())
    }

    /// Row-locked read, `Job::apply`, write back.
    #[instrument(skip(self, transition), fields(job_id = %job_id, to = %transition.target()), err)]
    async fn transition(&self, job_id: JobId, transition: JobTransition) -> Result<Job, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("transition", e))?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("transition", e))?
        .ok_or(JobStoreError::NotFound(job_id))?;

        let mut job = job_from_row(&row)?;
        job.apply(transition);
        Self::write_job(&mut *tx, &job).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("transition", e))?;
        Ok(job)
    }

    async fn update_progress(&self, job_id: JobId, progress: &ProgressRecord) -> Result<(), JobStoreError> {
        let result = sqlx::query("UPDATE generation_jobs SET progress = $2 WHERE id = $1")
            .bind(job_id.as_uuid())
            .bind(Json(progress))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_progress", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job_id));
        }
        Ok(())
    }

    #[instrument(skip(self, output), fields(job_id = %job_id), err)]
    async fn save_output(&self, job_id: JobId, output: &JobOutput) -> Result<String, JobStoreError> {
        let result_ref = format!("result:{job_id}");
        let result = sqlx::query(
            "UPDATE generation_jobs SET result = $2, usage = $3, cost_usd = $4 WHERE id = $1",
        )
        .bind(job_id.as_uuid())
        .bind(Json(&output.result))
        .bind(output.usage.as_ref().map(Json))
        .bind(output.cost_usd)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_output", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job_id));
        }
        Ok(result_ref)
    }

    async fn load_output(&self, result_ref: &str) -> Result<Option<serde_json::Value>, JobStoreError> {
        let Some(id) = result_ref
            .strip_prefix("result:")
            .and_then(|s| s.parse::<JobId>().ok())
        else {
            return Ok(None);
        };

        let row = sqlx::query("SELECT result FROM generation_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_output", e))?;

        match row {
            Some(row) => {
                let value: Option<Json<serde_json::Value>> = row
                    .try_get("result")
                    .map_err(|e| JobStoreError::Storage(format!("failed to read result: {e}")))?;
                Ok(value.map(|Json(v)| v))
            }
            None => Ok(None),
        }
    }

    /// Single `UPDATE`: concurrent sweeps cannot double-count a job.
    #[instrument(skip(self), fields(reclaimed = tracing::field::Empty), err)]
    async fn sweep(
        &self,
        pending_ttl: Duration,
        running_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, JobStoreError> {
        let pending_cutoff = earlier_by(now, pending_ttl);
        let running_cutoff = earlier_by(now, running_ttl);

        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = 'failed',
                error_message = $1,
                started_at = COALESCE(started_at, $2),
                completed_at = GREATEST($2, COALESCE(started_at, $2)),
                result_ref = NULL
            WHERE (status = 'pending' AND created_at < $3)
               OR (status = 'running' AND COALESCE(started_at, created_at) < $4)
            "#,
        )
        .bind(STALE_JOB_MESSAGE)
        .bind(now)
        .bind(pending_cutoff)
        .bind(running_cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("sweep", e))?;

        let reclaimed = result.rows_affected() as usize;
        Span::current().record("reclaimed", reclaimed);
        Ok(reclaimed)
    }

    async fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE status = $1 ORDER BY created_at ASC LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_status", e))?;

        rows.iter().map(job_from_row).collect()
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let column = |e: sqlx::Error| JobStoreError::Storage(format!("failed to decode job row: {e}"));

    let id: uuid::Uuid = row.try_get("id").map_err(column)?;
    let kind: String = row.try_get("kind").map_err(column)?;
    let status: String = row.try_get("status").map_err(column)?;
    let Json(payload): Json<serde_json::Value> = row.try_get("payload").map_err(column)?;
    let attempt: i32 = row.try_get("attempt").map_err(column)?;
    let progress: Option<Json<ProgressRecord>> = row.try_get("progress").map_err(column)?;
    let usage: Option<Json<UsageRecord>> = row.try_get("usage").map_err(column)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        kind: kind
            .parse::<JobKind>()
            .map_err(|e| JobStoreError::Storage(e.to_string()))?,
        status: status
            .parse::<JobStatus>()
            .map_err(|e| JobStoreError::Storage(e.to_string()))?,
        payload,
        attempt: attempt.max(0) as u32,
        created_at: row.try_get("created_at").map_err(column)?,
        started_at: row.try_get("started_at").map_err(column)?,
        completed_at: row.try_get("completed_at").map_err(column)?,
        error_message: row.try_get("error_message").map_err(column)?,
        result_ref: row.try_get("result_ref").map_err(column)?,
        progress: progress.map(|Json(p)| p),
        usage: usage.map(|Json(u)| u),
        cost_usd: row.try_get("cost_usd").map_err(column)?,
    })
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

/// Map SQLx errors into `JobStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::Io(e) => JobStoreError::Unavailable(format!("io error in {}: {}", operation, e)),
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_map_to_unavailable() {
        assert!(matches!(
            map_sqlx_error("get", sqlx::Error::PoolTimedOut),
            JobStoreError::Unavailable(_)
        ));
        assert!(matches!(
            map_sqlx_error("get", sqlx::Error::PoolClosed),
            JobStoreError::Unavailable(_)
        ));
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(map_sqlx_error("get", sqlx::Error::Io(io)), JobStoreError::Unavailable(_)));
    }

    #[test]
    fn other_errors_map_to_storage() {
        let err = map_sqlx_error("get", sqlx::Error::RowNotFound);
        assert!(matches!(err, JobStoreError::Storage(msg) if msg.contains("get")));
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }

    #[tokio::test]
    async fn foreign_result_refs_resolve_to_nothing() {
        // connect_lazy never touches the network until a query runs
        let pool = PgPool::connect_lazy("postgres://inkwell@127.0.0.1:1/inkwell").unwrap();
        let store = PostgresJobStore::new(pool);
        assert_eq!(store.load_output("s3://bucket/key").await.unwrap(), None);
        assert_eq!(store.load_output("result:not-a-uuid").await.unwrap(), None);
    }
}
