use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use oncall_core::{BackgroundJob, JobType, NewJob};

use crate::error::{StoreError, StoreResult};
use crate::traits::{JobStore, STALE_ERROR};

use super::{count_from_db, PgStore};

const JOB_COLUMNS: &str =
    "id, job_type, status, run_at, payload, attempts, max_attempts, last_error, started_at, finished_at, created_at";

fn job_from_row(row: &PgRow) -> StoreResult<BackgroundJob> {
    let job_type: String = row.try_get("job_type")?;
    let status: String = row.try_get("status")?;
    Ok(BackgroundJob {
        id: row.try_get("id")?,
        job_type: JobType::from(job_type),
        status: status.parse()?,
        run_at: row.try_get("run_at")?,
        payload: row.try_get("payload")?,
        attempts: count_from_db("attempts", row.try_get("attempts")?)?,
        max_attempts: count_from_db("max_attempts", row.try_get("max_attempts")?)?,
        last_error: row.try_get("last_error")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn attempts_to_db(value: u32) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| StoreError::Corrupt(format!("max_attempts {value} out of range")))
}

impl PgStore {
    /// Run a single-row job transition, reporting a missing row as `NotFound`.
    async fn update_job(&self, id: Uuid, query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>) -> StoreResult<()> {
        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> StoreResult<BackgroundJob> {
        let sql = format!(
            "INSERT INTO background_jobs (id, job_type, status, run_at, payload, attempts, max_attempts, created_at)
             VALUES ($1, $2, 'pending', $3, $4, 0, $5, $6)
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(job.job_type.as_str())
            .bind(job.run_at)
            .bind(&job.payload)
            .bind(attempts_to_db(job.max_attempts)?)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        job_from_row(&row)
    }

    async fn claim(
        &self,
        limit: u32,
        job_type: Option<&JobType>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<BackgroundJob>> {
        let sql = format!(
            "UPDATE background_jobs
             SET status = 'processing', started_at = $1, attempts = attempts + 1
             WHERE id IN (
                 SELECT id FROM background_jobs
                 WHERE status = 'pending'
                   AND run_at <= $1
                   AND attempts < max_attempts
                   AND ($2::TEXT IS NULL OR job_type = $2)
                 ORDER BY run_at
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(job_type.map(|t| t.as_str().to_string()))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        let mut jobs = rows.iter().map(job_from_row).collect::<StoreResult<Vec<_>>>()?;
        jobs.sort_by_key(|j| (j.run_at, j.id));
        Ok(jobs)
    }

    async fn complete(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<()> {
        self.update_job(
            id,
            sqlx::query("UPDATE background_jobs SET status = 'completed', finished_at = $2 WHERE id = $1")
                .bind(id)
                .bind(now),
        )
        .await
    }

    async fn retry(&self, id: Uuid, run_at: DateTime<Utc>, error: &str) -> StoreResult<()> {
        self.update_job(
            id,
            sqlx::query(
                "UPDATE background_jobs SET status = 'pending', run_at = $2, last_error = $3 WHERE id = $1",
            )
            .bind(id)
            .bind(run_at)
            .bind(error.to_string()),
        )
        .await
    }

    async fn fail(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> StoreResult<()> {
        self.update_job(
            id,
            sqlx::query(
                "UPDATE background_jobs SET status = 'failed', last_error = $2, finished_at = $3 WHERE id = $1",
            )
            .bind(id)
            .bind(error.to_string())
            .bind(now),
        )
        .await
    }

    async fn cancel(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> StoreResult<()> {
        self.update_job(
            id,
            sqlx::query(
                "UPDATE background_jobs SET status = 'cancelled', last_error = $2, finished_at = $3 WHERE id = $1",
            )
            .bind(id)
            .bind(reason.to_string())
            .bind(now),
        )
        .await
    }

    async fn reschedule(&self, id: Uuid, run_at: DateTime<Utc>) -> StoreResult<()> {
        self.update_job(
            id,
            sqlx::query(
                "UPDATE background_jobs
                 SET status = 'pending', run_at = $2, attempts = GREATEST(attempts - 1, 0)
                 WHERE id = $1",
            )
            .bind(id)
            .bind(run_at),
        )
        .await
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<BackgroundJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM background_jobs WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn cleanup(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM background_jobs
             WHERE status IN ('completed', 'cancelled') AND finished_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn next_job_due(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let next = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MIN(run_at) FROM background_jobs WHERE status = 'pending' AND attempts < max_attempts",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(next)
    }

    async fn requeue_stale(&self, stale_before: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE background_jobs
             SET status = CASE WHEN attempts < max_attempts THEN 'pending' ELSE 'failed' END,
                 run_at = CASE WHEN attempts < max_attempts THEN $2 ELSE run_at END,
                 finished_at = CASE WHEN attempts < max_attempts THEN NULL ELSE $2 END,
                 last_error = $3
             WHERE id IN (
                 SELECT id FROM background_jobs
                 WHERE status = 'processing' AND started_at < $1
                 FOR UPDATE SKIP LOCKED
             )",
        )
        .bind(stale_before)
        .bind(now)
        .bind(STALE_ERROR)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn oldest_processing_start(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let oldest = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MIN(started_at) FROM background_jobs WHERE status = 'processing'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(oldest)
    }
}
