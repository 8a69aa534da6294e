use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

use oncall_core::{Channel, LayerMember, OnCallLayer, OnCallOverride, Schedule, Team, TeamMember};

use crate::error::{StoreError, StoreResult};
use crate::traits::Directory;

use super::PgStore;

#[async_trait]
impl Directory for PgStore {
    async fn team(&self, id: Uuid) -> StoreResult<Option<Team>> {
        let Some(row) = sqlx::query("SELECT id, name, lead_id FROM teams WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let members = sqlx::query_as::<_, (Uuid, bool)>(
            "SELECT user_id, team_notifications FROM team_members WHERE team_id = $1 ORDER BY user_id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|(user_id, team_notifications)| TeamMember { user_id, team_notifications })
        .collect();

        Ok(Some(Team {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            lead_id: row.try_get("lead_id")?,
            members,
        }))
    }

    async fn schedule(&self, id: Uuid) -> StoreResult<Option<Schedule>> {
        let Some(name) = sqlx::query_scalar::<_, String>("SELECT name FROM schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let layer_rows = sqlx::query(
            "SELECT id, name, start_at, end_at, rotation_hours
             FROM oncall_layers WHERE schedule_id = $1 ORDER BY start_at, id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let layer_ids: Vec<Uuid> = layer_rows
            .iter()
            .map(|r| r.try_get::<Uuid, _>("id"))
            .collect::<Result<_, _>>()?;
        let member_rows = sqlx::query_as::<_, (Uuid, Uuid, i32)>(
            "SELECT layer_id, user_id, position FROM oncall_layer_members
             WHERE layer_id = ANY($1) ORDER BY position",
        )
        .bind(&layer_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut layers = Vec::with_capacity(layer_rows.len());
        for row in &layer_rows {
            let layer_id: Uuid = row.try_get("id")?;
            let rotation_hours: i32 = row.try_get("rotation_hours")?;
            let members = member_rows
                .iter()
                .filter(|(lid, _, _)| *lid == layer_id)
                .map(|(_, user_id, position)| -> StoreResult<LayerMember> {
                    let position = u32::try_from(*position)
                        .map_err(|_| StoreError::Corrupt(format!("layer member position {position}")))?;
                    Ok(LayerMember { user_id: *user_id, position })
                })
                .collect::<StoreResult<Vec<_>>>()?;
            layers.push(OnCallLayer {
                id: layer_id,
                name: row.try_get("name")?,
                start: row.try_get("start_at")?,
                end: row.try_get("end_at")?,
                rotation_hours: i64::from(rotation_hours),
                members,
            });
        }

        let overrides = sqlx::query(
            "SELECT id, user_id, start_at, end_at, replaces_user_id
             FROM oncall_overrides WHERE schedule_id = $1 ORDER BY start_at, id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| -> StoreResult<OnCallOverride> {
            Ok(OnCallOverride {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                start: row.try_get("start_at")?,
                end: row.try_get("end_at")?,
                replaces_user_id: row.try_get("replaces_user_id")?,
            })
        })
        .collect::<StoreResult<Vec<_>>>()?;

        Ok(Some(Schedule { id, name, layers, overrides }))
    }

    async fn preferred_channels(&self, user_id: Uuid) -> StoreResult<Vec<Channel>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT channel FROM user_channel_preferences WHERE user_id = $1 ORDER BY rank, channel",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        let channels = names
            .iter()
            .map(|c| c.parse::<Channel>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(channels)
    }
}
