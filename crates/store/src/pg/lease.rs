use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::Row;

use oncall_core::SchedulerLease;

use crate::error::{StoreError, StoreResult};
use crate::traits::{LeaseRelease, LeaseStore};

use super::PgStore;

#[async_trait]
impl LeaseStore for PgStore {
    async fn acquire_lease(&self, holder: &str, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE scheduler_lease SET holder = $1, held_since = $2
             WHERE id = 1
               AND (holder IS NULL OR holder = $1 OR held_since IS NULL OR held_since < $3)",
        )
        .bind(holder)
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, holder: &str, release: LeaseRelease) -> StoreResult<()> {
        sqlx::query(
            "UPDATE scheduler_lease
             SET holder = NULL, held_since = NULL, last_run_at = $2,
                 last_success_at = CASE WHEN $3 THEN $2 ELSE last_success_at END,
                 last_error = $4, next_run_at = $5
             WHERE id = 1 AND holder = $1",
        )
        .bind(holder)
        .bind(release.ran_at)
        .bind(release.succeeded)
        .bind(release.error)
        .bind(release.next_run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lease(&self) -> StoreResult<SchedulerLease> {
        let row = sqlx::query(
            "SELECT holder, held_since, last_run_at, last_success_at, last_error, next_run_at, last_daily_run
             FROM scheduler_lease WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound("scheduler lease row".to_string()))?;
        Ok(SchedulerLease {
            holder: row.try_get("holder")?,
            held_since: row.try_get("held_since")?,
            last_run_at: row.try_get("last_run_at")?,
            last_success_at: row.try_get("last_success_at")?,
            last_error: row.try_get("last_error")?,
            next_run_at: row.try_get("next_run_at")?,
            last_daily_run: row.try_get("last_daily_run")?,
        })
    }

    async fn record_daily_run(&self, date: NaiveDate) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE scheduler_lease SET last_daily_run = $1
             WHERE id = 1 AND (last_daily_run IS NULL OR last_daily_run < $1)",
        )
        .bind(date)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
