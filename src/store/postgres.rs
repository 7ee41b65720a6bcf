//! PostgreSQL implementation of [`JobStore`].
//!
//! Claims serialize on a transaction-scoped advisory lock so that the
//! per-handler running count and the row lock are taken in one critical
//! section. Inside it the candidate row is still selected with
//! `FOR UPDATE SKIP LOCKED`, which keeps outcome writes from other workers
//! from blocking a claim.

use super::{ClaimRequest, EnqueueOutcome, JobFilter, JobStore, RunOutcome};
use crate::{
    FramecastError, Result,
    job::{Job, JobId},
    priority::JobPriority,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use tracing::debug;

/// Advisory lock key shared by every claimer.
const CLAIM_LOCK_KEY: i64 = 0x6672_616d_6563_6173;

const JOB_COLUMNS: &str = "id, name, data, priority, job_key, owner, progress, repeat_cron, \
     repeat_timezone, queued_at, next_run_at, locked_at, locked_by, last_run_at, \
     last_finished_at, failed_at, fail_reason";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS framecast_jobs (
        id UUID PRIMARY KEY,
        name VARCHAR NOT NULL,
        data JSONB NOT NULL DEFAULT '{}'::jsonb,
        priority INTEGER NOT NULL DEFAULT 0,
        job_key VARCHAR,
        owner VARCHAR,
        progress SMALLINT NOT NULL DEFAULT 0,
        repeat_cron VARCHAR,
        repeat_timezone VARCHAR,
        queued_at TIMESTAMPTZ NOT NULL,
        next_run_at TIMESTAMPTZ NOT NULL,
        locked_at TIMESTAMPTZ,
        locked_by VARCHAR,
        last_run_at TIMESTAMPTZ,
        last_finished_at TIMESTAMPTZ,
        failed_at TIMESTAMPTZ,
        fail_reason TEXT
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_framecast_jobs_key \
     ON framecast_jobs (name, job_key) WHERE job_key IS NOT NULL",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_framecast_jobs_recurring \
     ON framecast_jobs (name) WHERE repeat_cron IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_framecast_jobs_claim \
     ON framecast_jobs (priority DESC, next_run_at ASC) WHERE locked_at IS NULL",
    "CREATE INDEX IF NOT EXISTS idx_framecast_jobs_owner \
     ON framecast_jobs (owner, queued_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_framecast_jobs_locked \
     ON framecast_jobs (locked_at) WHERE locked_at IS NOT NULL",
];

#[derive(FromRow)]
struct JobRow {
    id: uuid::Uuid,
    name: String,
    data: serde_json::Value,
    priority: i32,
    job_key: Option<String>,
    owner: Option<String>,
    progress: i16,
    repeat_cron: Option<String>,
    repeat_timezone: Option<String>,
    queued_at: DateTime<Utc>,
    next_run_at: DateTime<Utc>,
    locked_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    last_run_at: Option<DateTime<Utc>>,
    last_finished_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    fail_reason: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Job {
        Job {
            id: self.id,
            name: self.name,
            data: self.data,
            priority: JobPriority::from_i32(self.priority).unwrap_or_default(),
            job_key: self.job_key,
            owner: self.owner,
            progress: self.progress.clamp(0, 100) as u8,
            repeat_cron: self.repeat_cron,
            repeat_timezone: self.repeat_timezone,
            queued_at: self.queued_at,
            next_run_at: self.next_run_at,
            locked_at: self.locked_at,
            locked_by: self.locked_by,
            last_run_at: self.last_run_at,
            last_finished_at: self.last_finished_at,
            failed_at: self.failed_at,
            fail_reason: self.fail_reason,
        }
    }
}

/// Appends `WHERE` criteria for `filter` to a query that selects from or
/// deletes in `framecast_jobs`.
fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &JobFilter) {
    builder.push(" WHERE TRUE");
    if let Some(id) = filter.id {
        builder.push(" AND id = ").push_bind(id);
    }
    if let Some(name) = &filter.name {
        builder.push(" AND name = ").push_bind(name.clone());
    }
    if let Some(key) = &filter.job_key {
        builder.push(" AND job_key = ").push_bind(key.clone());
    }
    if let Some(owner) = &filter.owner {
        builder.push(" AND owner = ").push_bind(owner.clone());
    }
}

fn push_order_and_limit(builder: &mut QueryBuilder<'_, Postgres>, filter: &JobFilter) {
    if filter.newest_first {
        builder.push(" ORDER BY queued_at DESC, id DESC");
    } else {
        builder.push(" ORDER BY queued_at ASC, id ASC");
    }
    if let Some(limit) = filter.limit {
        builder.push(" LIMIT ").push_bind(limit as i64);
    }
}

/// Job store backed by a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a pool against `url`, reporting connection problems as
    /// [`FramecastError::StoreUnavailable`].
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: std::time::Duration,
    ) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| FramecastError::StoreUnavailable {
                message: e.to_string(),
            })?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_job(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM framecast_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(JobRow::into_job))
    }

    /// Distinguishes a missing record from one whose lock moved elsewhere.
    async fn lease_error(&self, id: JobId) -> Result<FramecastError> {
        Ok(match self.fetch_job(id).await? {
            Some(_) => FramecastError::LeaseLost { id: id.to_string() },
            None => FramecastError::JobNotFound { id: id.to_string() },
        })
    }
}

/// Outcome writes accept a record the worker still holds, or one whose lock
/// was released as stale but not yet reclaimed.
const FINISHABLE: &str = "((locked_by = $2 AND locked_at IS NOT NULL) \
     OR (locked_at IS NULL AND (repeat_cron IS NOT NULL \
         OR (last_finished_at IS NULL AND failed_at IS NULL))))";

#[async_trait]
impl JobStore for PostgresStore {
    async fn create_tables(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome> {
        let inserted: Option<uuid::Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO framecast_jobs
                (id, name, data, priority, job_key, owner, progress, repeat_cron,
                 repeat_timezone, queued_at, next_run_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (name, job_key) WHERE job_key IS NOT NULL DO NOTHING
            RETURNING id
            "#,
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(&job.data)
        .bind(job.priority.as_i32())
        .bind(&job.job_key)
        .bind(&job.owner)
        .bind(job.progress as i16)
        .bind(&job.repeat_cron)
        .bind(&job.repeat_timezone)
        .bind(job.queued_at)
        .bind(job.next_run_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = inserted {
            return Ok(EnqueueOutcome::Created(id));
        }

        let existing: uuid::Uuid = sqlx::query_scalar(
            "SELECT id FROM framecast_jobs WHERE name = $1 AND job_key = $2",
        )
        .bind(&job.name)
        .bind(&job.job_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(EnqueueOutcome::Existing(existing))
    }

    async fn upsert_recurring(&self, job: Job) -> Result<JobId> {
        let id: uuid::Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO framecast_jobs
                (id, name, data, priority, repeat_cron, repeat_timezone, queued_at, next_run_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (name) WHERE repeat_cron IS NOT NULL DO UPDATE SET
                priority = EXCLUDED.priority,
                next_run_at = CASE
                    WHEN framecast_jobs.repeat_cron IS DISTINCT FROM EXCLUDED.repeat_cron
                      OR framecast_jobs.repeat_timezone IS DISTINCT FROM EXCLUDED.repeat_timezone
                    THEN EXCLUDED.next_run_at
                    ELSE framecast_jobs.next_run_at
                END,
                repeat_cron = EXCLUDED.repeat_cron,
                repeat_timezone = EXCLUDED.repeat_timezone
            RETURNING id
            "#,
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(&job.data)
        .bind(job.priority.as_i32())
        .bind(&job.repeat_cron)
        .bind(&job.repeat_timezone)
        .bind(job.queued_at)
        .bind(job.next_run_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        self.fetch_job(id).await
    }

    async fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut builder = QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM framecast_jobs"));
        push_filter(&mut builder, filter);
        push_order_and_limit(&mut builder, filter);

        let rows = builder
            .build_query_as::<JobRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(JobRow::into_job).collect())
    }

    async fn claim_next(&self, request: &ClaimRequest) -> Result<Option<Job>> {
        if request.handlers.is_empty() {
            return Ok(None);
        }

        let names: Vec<String> = request.handlers.iter().map(|cap| cap.name.clone()).collect();
        let caps: Vec<i32> = request
            .handlers
            .iter()
            .map(|cap| cap.max_running.min(i32::MAX as u32) as i32)
            .collect();

        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(CLAIM_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            WITH caps AS (
                SELECT * FROM UNNEST($1::text[], $2::int[]) AS c(name, max_running)
            ),
            running AS (
                SELECT name, COUNT(*) AS n FROM framecast_jobs
                WHERE locked_at IS NOT NULL
                GROUP BY name
            )
            UPDATE framecast_jobs
            SET locked_at = $3, locked_by = $4, last_run_at = $3
            WHERE id = (
                SELECT j.id FROM framecast_jobs j
                JOIN caps c ON c.name = j.name
                LEFT JOIN running r ON r.name = j.name
                WHERE j.locked_at IS NULL
                  AND j.next_run_at <= $3
                  AND (j.repeat_cron IS NOT NULL
                       OR (j.last_finished_at IS NULL AND j.failed_at IS NULL))
                  AND COALESCE(r.n, 0) < c.max_running
                ORDER BY j.priority DESC, j.next_run_at ASC, j.queued_at ASC
                LIMIT 1
                FOR UPDATE OF j SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(&names)
        .bind(&caps)
        .bind(request.now)
        .bind(&request.worker)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        if let Some(row) = &row {
            debug!(job_id = %row.id, name = %row.name, worker = %request.worker, "Claimed job");
        }
        Ok(row.map(JobRow::into_job))
    }

    async fn update_progress(
        &self,
        id: JobId,
        worker: &str,
        progress: u8,
        heartbeat: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE framecast_jobs
            SET progress = GREATEST(progress, $3), locked_at = COALESCE($4, locked_at)
            WHERE id = $1 AND locked_by = $2 AND locked_at IS NOT NULL
            "#,
        )
        .bind(id)
        .bind(worker)
        .bind(progress.min(100) as i16)
        .bind(heartbeat)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.lease_error(id).await?);
        }
        Ok(())
    }

    async fn complete_job(
        &self,
        id: JobId,
        worker: &str,
        output: Option<serde_json::Value>,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        let output = match output {
            Some(value @ serde_json::Value::Object(_)) => value,
            _ => serde_json::json!({}),
        };

        let result = sqlx::query(&format!(
            r#"
            UPDATE framecast_jobs
            SET progress = 100, last_finished_at = $3, data = data || $4,
                locked_at = NULL, locked_by = NULL
            WHERE id = $1 AND {FINISHABLE}
            "#
        ))
        .bind(id)
        .bind(worker)
        .bind(finished_at)
        .bind(output)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.lease_error(id).await?);
        }
        Ok(())
    }

    async fn fail_job(
        &self,
        id: JobId,
        worker: &str,
        reason: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE framecast_jobs
            SET failed_at = $3, fail_reason = $4, locked_at = NULL, locked_by = NULL
            WHERE id = $1 AND {FINISHABLE}
            "#
        ))
        .bind(id)
        .bind(worker)
        .bind(failed_at)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.lease_error(id).await?);
        }
        Ok(())
    }

    async fn reschedule_recurring(
        &self,
        id: JobId,
        worker: &str,
        outcome: RunOutcome,
        finished_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        // A failed run keeps its last successful finish time.
        let (outcome_columns, reason) = match outcome {
            RunOutcome::Succeeded => (
                "last_finished_at = $3, failed_at = NULL, fail_reason = NULL",
                None,
            ),
            RunOutcome::Failed(reason) => ("failed_at = $3, fail_reason = $5", Some(reason)),
        };
        let sql = format!(
            r#"
            UPDATE framecast_jobs
            SET {outcome_columns}, next_run_at = $4, progress = 0,
                locked_at = NULL, locked_by = NULL
            WHERE id = $1 AND {FINISHABLE}
            "#
        );

        let mut query = sqlx::query(&sql)
            .bind(id)
            .bind(worker)
            .bind(finished_at)
            .bind(next_run_at);
        if let Some(reason) = reason {
            query = query.bind(reason);
        }

        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(self.lease_error(id).await?);
        }
        Ok(())
    }

    async fn release_stale_locks(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE framecast_jobs
            SET locked_at = NULL, locked_by = NULL
            WHERE locked_at IS NOT NULL AND locked_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn cancel(&self, filter: &JobFilter) -> Result<u64> {
        let mut builder = QueryBuilder::new("DELETE FROM framecast_jobs");
        push_filter(&mut builder, filter);
        builder.push(" AND locked_at IS NULL");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            DELETE FROM framecast_jobs
            WHERE repeat_cron IS NULL
              AND locked_at IS NULL
              AND ((last_finished_at IS NOT NULL AND last_finished_at < $1)
                   OR (failed_at IS NOT NULL AND failed_at < $1))
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(JobRow::into_job).collect())
    }
}
