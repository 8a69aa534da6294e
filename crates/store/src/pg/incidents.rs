use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use oncall_core::{Channel, EscalationStep, Incident, TimelineEntry};

use crate::error::{StoreError, StoreResult};
use crate::traits::{EscalationAdvance, IncidentStore};

use super::{index_from_db, index_to_db, PgStore};

const INCIDENT_COLUMNS: &str = "id, title, status, service_id, assignee_id, team_id, snoozed_until, \
     escalation_status, escalation_step, next_escalation_at, processing_started_at";

/// Lock predicate shared by claims and the due-sweep query. `$stale` is the
/// bind position of the stale-before timestamp.
fn lock_free(stale: &str) -> String {
    format!("(processing_started_at IS NULL OR processing_started_at < {stale})")
}

fn incident_from_row(row: &PgRow) -> StoreResult<Incident> {
    let status: String = row.try_get("status")?;
    let escalation: String = row.try_get("escalation_status")?;
    let step: Option<i32> = row.try_get("escalation_step")?;
    Ok(Incident {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        status: status.parse()?,
        service_id: row.try_get("service_id")?,
        assignee_id: row.try_get("assignee_id")?,
        team_id: row.try_get("team_id")?,
        snoozed_until: row.try_get("snoozed_until")?,
        escalation: escalation.parse()?,
        step_index: step.map(index_from_db).transpose()?,
        next_escalation_at: row.try_get("next_escalation_at")?,
        processing_started_at: row.try_get("processing_started_at")?,
    })
}

fn step_from_row(row: &PgRow) -> StoreResult<EscalationStep> {
    let order: i32 = row.try_get("step_order")?;
    let delay: i32 = row.try_get("delay_minutes")?;
    let target_type: String = row.try_get("target_type")?;
    let channels: Vec<String> = row.try_get("channels")?;
    Ok(EscalationStep {
        order: u32::try_from(order).map_err(|_| StoreError::Corrupt(format!("step order {order}")))?,
        delay_minutes: u32::try_from(delay).map_err(|_| StoreError::Corrupt(format!("step delay {delay}")))?,
        target_type: target_type.parse()?,
        target_id: row.try_get("target_id")?,
        notify_team_lead_only: row.try_get("notify_team_lead_only")?,
        channels: channels
            .iter()
            .map(|c| c.parse::<Channel>())
            .collect::<Result<_, _>>()?,
    })
}

#[async_trait]
impl IncidentStore for PgStore {
    async fn get_incident(&self, id: Uuid) -> StoreResult<Option<Incident>> {
        let sql = format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(incident_from_row).transpose()
    }

    async fn policy_steps(&self, service_id: Uuid) -> StoreResult<Vec<EscalationStep>> {
        let rows = sqlx::query(
            "SELECT s.step_order, s.delay_minutes, s.target_type, s.target_id,
                    s.notify_team_lead_only, s.channels
             FROM escalation_steps s
             JOIN escalation_policies p ON p.id = s.policy_id
             WHERE p.service_id = $1
             ORDER BY s.step_order",
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(step_from_row).collect()
    }

    async fn clear_escalation(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query(
            "UPDATE incidents
             SET escalation_status = 'not_started', escalation_step = NULL,
                 next_escalation_at = NULL, processing_started_at = NULL
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn schedule_step(&self, id: Uuid, step_index: usize, run_at: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE incidents
             SET escalation_status = 'escalating', escalation_step = $2, next_escalation_at = $3
             WHERE id = $1
               AND next_escalation_at IS NULL
               AND escalation_status IN ('not_started', 'escalating')",
        )
        .bind(id)
        .bind(index_to_db(step_index)?)
        .bind(run_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_step(
        &self,
        id: Uuid,
        expected_step: usize,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let sql = format!(
            "UPDATE incidents
             SET escalation_status = 'escalating', escalation_step = $2, processing_started_at = $3
             WHERE id = $1
               AND (escalation_step = $2 OR ($2 = 0 AND escalation_step IS NULL))
               AND escalation_status IN ('not_started', 'escalating')
               AND {}",
            lock_free("$4")
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(index_to_db(expected_step)?)
            .bind(now)
            .bind(stale_before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_step_index(&self, id: Uuid, step_index: usize) -> StoreResult<()> {
        let result = sqlx::query("UPDATE incidents SET escalation_step = $2 WHERE id = $1")
            .bind(id)
            .bind(index_to_db(step_index)?)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("incident {id}")));
        }
        Ok(())
    }

    async fn assign_if_unassigned(&self, id: Uuid, user_id: Option<Uuid>, team_id: Option<Uuid>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE incidents SET assignee_id = $2, team_id = $3
             WHERE id = $1 AND assignee_id IS NULL AND team_id IS NULL",
        )
        .bind(id)
        .bind(user_id)
        .bind(team_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn advance_escalation(&self, id: Uuid, advance: EscalationAdvance) -> StoreResult<()> {
        let result = match advance {
            EscalationAdvance::Next { step_index, next_at } => {
                sqlx::query(
                    "UPDATE incidents
                     SET escalation_status = 'escalating', escalation_step = $2,
                         next_escalation_at = $3, processing_started_at = NULL
                     WHERE id = $1",
                )
                .bind(id)
                .bind(index_to_db(step_index)?)
                .bind(next_at)
                .execute(&self.pool)
                .await?
            }
            EscalationAdvance::Completed => {
                sqlx::query(
                    "UPDATE incidents
                     SET escalation_status = 'completed', next_escalation_at = NULL,
                         processing_started_at = NULL
                     WHERE id = $1",
                )
                .bind(id)
                .execute(&self.pool)
                .await?
            }
        };
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("incident {id}")));
        }
        Ok(())
    }

    async fn release_lock(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE incidents SET processing_started_at = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_timeline(&self, entry: TimelineEntry) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO incident_timeline (incident_id, kind, message, created_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(entry.incident_id)
        .bind(entry.kind.as_str())
        .bind(&entry.message)
        .bind(entry.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due_escalations(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<Uuid>> {
        let sql = format!(
            "SELECT id FROM incidents
             WHERE escalation_status = 'escalating'
               AND status IN ('open', 'snoozed')
               AND next_escalation_at <= $1
               AND {}
             ORDER BY next_escalation_at
             LIMIT $3",
            lock_free("$2")
        );
        let ids = sqlx::query_scalar::<_, Uuid>(&sql)
            .bind(now)
            .bind(stale_before)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn next_escalation_due(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let next = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MIN(next_escalation_at) FROM incidents
             WHERE escalation_status = 'escalating' AND status IN ('open', 'snoozed')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(next)
    }

    async fn unsnooze_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        let mut ids = sqlx::query_scalar::<_, Uuid>(
            "UPDATE incidents SET status = 'open', snoozed_until = NULL
             WHERE status = 'snoozed' AND snoozed_until <= $1
             RETURNING id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        ids.sort();
        Ok(ids)
    }

    async fn unsnooze(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE incidents SET status = 'open', snoozed_until = NULL
             WHERE id = $1 AND status = 'snoozed' AND snoozed_until <= $2",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn next_snooze_expiry(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let next = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MIN(snoozed_until) FROM incidents WHERE status = 'snoozed'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(next)
    }
}
