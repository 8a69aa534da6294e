//! Turns an escalation step's target into the users to notify.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use oncall_core::{EscalationStep, TargetType, Team};
use oncall_rotation::users_on_call_at;
use oncall_store::{Directory, StoreResult};

/// Resolved target of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Users to notify, in order. `team_id` is set for team targets.
    Users { user_ids: Vec<Uuid>, team_id: Option<Uuid> },
    /// Nobody to notify. Not an error: the engine notes it and moves on.
    Skip { reason: String },
}

impl Target {
    fn skip(reason: impl Into<String>) -> Self {
        Target::Skip { reason: reason.into() }
    }
}

pub async fn resolve_target(directory: &dyn Directory, step: &EscalationStep, at: DateTime<Utc>) -> StoreResult<Target> {
    let Some(target_id) = step.target_id else {
        return Ok(Target::skip(format!("{} target has no id configured", step.target_type)));
    };

    match step.target_type {
        TargetType::User => Ok(Target::Users {
            user_ids: vec![target_id],
            team_id: None,
        }),
        TargetType::Team => {
            let Some(team) = directory.team(target_id).await? else {
                return Ok(Target::skip(format!("team {target_id} not found")));
            };
            Ok(team_recipients(&team, step.notify_team_lead_only))
        }
        TargetType::Schedule => {
            let Some(schedule) = directory.schedule(target_id).await? else {
                return Ok(Target::skip(format!("schedule {target_id} not found")));
            };
            let user_ids = users_on_call_at(&schedule, at);
            if user_ids.is_empty() {
                return Ok(Target::skip(format!("nobody is on call for schedule '{}'", schedule.name)));
            }
            Ok(Target::Users { user_ids, team_id: None })
        }
    }
}

fn team_recipients(team: &Team, lead_only: bool) -> Target {
    let opted_in = |user_id: Uuid| {
        team.members
            .iter()
            .find(|m| m.user_id == user_id)
            .map_or(true, |m| m.team_notifications)
    };

    let user_ids: Vec<Uuid> = if lead_only {
        match team.lead_id {
            None => return Target::skip(format!("team '{}' has no lead", team.name)),
            Some(lead) if !opted_in(lead) => {
                return Target::skip(format!("lead of team '{}' opted out of team notifications", team.name))
            }
            Some(lead) => vec![lead],
        }
    } else {
        team.members
            .iter()
            .filter(|m| m.team_notifications)
            .map(|m| m.user_id)
            .collect()
    };

    if user_ids.is_empty() {
        return Target::skip(format!("team '{}' has no members to notify", team.name));
    }
    Target::Users {
        user_ids,
        team_id: Some(team.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use oncall_core::{LayerMember, OnCallLayer, Schedule, TeamMember};
    use oncall_store::MemoryStore;

    fn step(target_type: TargetType, target_id: Option<Uuid>, lead_only: bool) -> EscalationStep {
        EscalationStep {
            order: 1,
            delay_minutes: 0,
            target_type,
            target_id,
            notify_team_lead_only: lead_only,
            channels: vec![],
        }
    }

    fn team(lead_opts_out: bool) -> Team {
        let lead = Uuid::new_v4();
        Team {
            id: Uuid::new_v4(),
            name: "payments".to_string(),
            lead_id: Some(lead),
            members: vec![
                TeamMember { user_id: lead, team_notifications: !lead_opts_out },
                TeamMember { user_id: Uuid::new_v4(), team_notifications: true },
                TeamMember { user_id: Uuid::new_v4(), team_notifications: false },
            ],
        }
    }

    #[tokio::test]
    async fn missing_target_id_is_skipped() {
        let store = MemoryStore::new();
        let target = resolve_target(&store, &step(TargetType::User, None, false), Utc::now()).await.unwrap();
        assert!(matches!(target, Target::Skip { .. }));
    }

    #[tokio::test]
    async fn team_target_notifies_opted_in_members() {
        let store = MemoryStore::new();
        let team = team(false);
        store.insert_team(team.clone());

        let target = resolve_target(&store, &step(TargetType::Team, Some(team.id), false), Utc::now())
            .await
            .unwrap();
        assert_eq!(
            target,
            Target::Users {
                user_ids: vec![team.members[0].user_id, team.members[1].user_id],
                team_id: Some(team.id),
            }
        );
    }

    #[tokio::test]
    async fn lead_only_uses_lead_unless_opted_out() {
        let store = MemoryStore::new();
        let with_lead = team(false);
        let opted_out = team(true);
        let mut leaderless = team(false);
        leaderless.lead_id = None;
        for t in [&with_lead, &opted_out, &leaderless] {
            store.insert_team(t.clone());
        }
        let now = Utc::now();

        let target = resolve_target(&store, &step(TargetType::Team, Some(with_lead.id), true), now).await.unwrap();
        assert_eq!(
            target,
            Target::Users { user_ids: vec![with_lead.lead_id.unwrap()], team_id: Some(with_lead.id) }
        );

        for t in [&opted_out, &leaderless] {
            let target = resolve_target(&store, &step(TargetType::Team, Some(t.id), true), now).await.unwrap();
            assert!(matches!(target, Target::Skip { .. }), "expected skip for {t:?}");
        }
    }

    #[tokio::test]
    async fn schedule_target_unions_simultaneous_layers() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let (primary, secondary) = (Uuid::new_v4(), Uuid::new_v4());
        let layer = |user: Uuid| OnCallLayer {
            id: Uuid::new_v4(),
            name: "layer".to_string(),
            start: now - Duration::days(1),
            end: None,
            rotation_hours: 168,
            members: vec![LayerMember { user_id: user, position: 0 }],
        };
        let schedule = Schedule {
            id: Uuid::new_v4(),
            name: "primary".to_string(),
            layers: vec![layer(primary), layer(secondary), layer(primary)],
            overrides: vec![],
        };
        store.insert_schedule(schedule.clone());

        let target = resolve_target(&store, &step(TargetType::Schedule, Some(schedule.id), false), now)
            .await
            .unwrap();
        match target {
            Target::Users { user_ids, team_id } => {
                assert_eq!(user_ids.len(), 2);
                assert!(user_ids.contains(&primary) && user_ids.contains(&secondary));
                assert_eq!(team_id, None);
            }
            other => panic!("expected users, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn schedule_with_nobody_on_call_is_skipped() {
        let store = MemoryStore::new();
        let schedule = Schedule {
            id: Uuid::new_v4(),
            name: "empty".to_string(),
            layers: vec![],
            overrides: vec![],
        };
        store.insert_schedule(schedule.clone());
        let target = resolve_target(&store, &step(TargetType::Schedule, Some(schedule.id), false), Utc::now())
            .await
            .unwrap();
        assert!(matches!(target, Target::Skip { .. }));
    }
}
