use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use oncall_core::{EscalationState, EscalationStep, Incident, IncidentStatus, TimelineEntry};

use crate::error::{StoreError, StoreResult};
use crate::traits::{EscalationAdvance, IncidentStore};

use super::MemoryStore;

fn lock_is_free(incident: &Incident, stale_before: DateTime<Utc>) -> bool {
    match incident.processing_started_at {
        None => true,
        Some(at) => at < stale_before,
    }
}

fn missing(id: Uuid) -> StoreError {
    StoreError::NotFound(format!("incident {id}"))
}

#[async_trait]
impl IncidentStore for MemoryStore {
    async fn get_incident(&self, id: Uuid) -> StoreResult<Option<Incident>> {
        let mut state = self.lock();
        state.fault("get_incident")?;
        Ok(state.incidents.get(&id).cloned())
    }

    async fn policy_steps(&self, service_id: Uuid) -> StoreResult<Vec<EscalationStep>> {
        let mut state = self.lock();
        state.fault("policy_steps")?;
        Ok(state.policies.get(&service_id).cloned().unwrap_or_default())
    }

    async fn clear_escalation(&self, id: Uuid) -> StoreResult<()> {
        let mut state = self.lock();
        state.fault("clear_escalation")?;
        let incident = state.incidents.get_mut(&id).ok_or_else(|| missing(id))?;
        incident.escalation = EscalationState::NotStarted;
        incident.step_index = None;
        incident.next_escalation_at = None;
        incident.processing_started_at = None;
        Ok(())
    }

    async fn schedule_step(&self, id: Uuid, step_index: usize, run_at: DateTime<Utc>) -> StoreResult<bool> {
        let mut state = self.lock();
        state.fault("schedule_step")?;
        let Some(incident) = state.incidents.get_mut(&id) else {
            return Ok(false);
        };
        if incident.next_escalation_at.is_some() || !incident.escalation.is_claimable() {
            return Ok(false);
        }
        incident.escalation = EscalationState::Escalating;
        incident.step_index = Some(step_index);
        incident.next_escalation_at = Some(run_at);
        Ok(true)
    }

    async fn claim_step(
        &self,
        id: Uuid,
        expected_step: usize,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.lock();
        state.fault("claim_step")?;
        let Some(incident) = state.incidents.get_mut(&id) else {
            return Ok(false);
        };

        let step_matches = match incident.step_index {
            Some(idx) => idx == expected_step,
            None => expected_step == 0,
        };
        if !step_matches || !incident.escalation.is_claimable() || !lock_is_free(incident, stale_before) {
            return Ok(false);
        }

        incident.escalation = EscalationState::Escalating;
        incident.step_index = Some(expected_step);
        incident.processing_started_at = Some(now);
        Ok(true)
    }

    async fn set_step_index(&self, id: Uuid, step_index: usize) -> StoreResult<()> {
        let mut state = self.lock();
        state.fault("set_step_index")?;
        let incident = state.incidents.get_mut(&id).ok_or_else(|| missing(id))?;
        incident.step_index = Some(step_index);
        Ok(())
    }

    async fn assign_if_unassigned(&self, id: Uuid, user_id: Option<Uuid>, team_id: Option<Uuid>) -> StoreResult<bool> {
        let mut state = self.lock();
        state.fault("assign_if_unassigned")?;
        let Some(incident) = state.incidents.get_mut(&id) else {
            return Ok(false);
        };
        if !incident.is_unassigned() {
            return Ok(false);
        }
        incident.assignee_id = user_id;
        incident.team_id = team_id;
        Ok(true)
    }

    async fn advance_escalation(&self, id: Uuid, advance: EscalationAdvance) -> StoreResult<()> {
        let mut state = self.lock();
        state.fault("advance_escalation")?;
        let incident = state.incidents.get_mut(&id).ok_or_else(|| missing(id))?;
        match advance {
            EscalationAdvance::Next { step_index, next_at } => {
                incident.escalation = EscalationState::Escalating;
                incident.step_index = Some(step_index);
                incident.next_escalation_at = Some(next_at);
            }
            EscalationAdvance::Completed => {
                incident.escalation = EscalationState::Completed;
                incident.next_escalation_at = None;
            }
        }
        incident.processing_started_at = None;
        Ok(())
    }

    async fn release_lock(&self, id: Uuid) -> StoreResult<()> {
        let mut state = self.lock();
        state.fault("release_lock")?;
        if let Some(incident) = state.incidents.get_mut(&id) {
            incident.processing_started_at = None;
        }
        Ok(())
    }

    async fn append_timeline(&self, entry: TimelineEntry) -> StoreResult<()> {
        let mut state = self.lock();
        state.fault("append_timeline")?;
        state.timeline.push(entry);
        Ok(())
    }

    async fn due_escalations(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<Uuid>> {
        let mut state = self.lock();
        state.fault("due_escalations")?;
        let mut due: Vec<(DateTime<Utc>, Uuid)> = state
            .incidents
            .values()
            .filter(|i| i.escalation == EscalationState::Escalating)
            .filter(|i| i.status.is_escalatable())
            .filter(|i| lock_is_free(i, stale_before))
            .filter_map(|i| i.next_escalation_at.filter(|at| *at <= now).map(|at| (at, i.id)))
            .collect();
        due.sort();
        Ok(due.into_iter().take(limit as usize).map(|(_, id)| id).collect())
    }

    async fn next_escalation_due(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let mut state = self.lock();
        state.fault("next_escalation_due")?;
        Ok(state
            .incidents
            .values()
            .filter(|i| i.escalation == EscalationState::Escalating && i.status.is_escalatable())
            .filter_map(|i| i.next_escalation_at)
            .min())
    }

    async fn unsnooze_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        let mut state = self.lock();
        state.fault("unsnooze_due")?;
        let mut reopened = Vec::new();
        for incident in state.incidents.values_mut() {
            if incident.status == IncidentStatus::Snoozed && matches!(incident.snoozed_until, Some(at) if at <= now) {
                incident.status = IncidentStatus::Open;
                incident.snoozed_until = None;
                reopened.push(incident.id);
            }
        }
        reopened.sort();
        Ok(reopened)
    }

    async fn unsnooze(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut state = self.lock();
        state.fault("unsnooze")?;
        let Some(incident) = state.incidents.get_mut(&id) else {
            return Ok(false);
        };
        if incident.status != IncidentStatus::Snoozed || !matches!(incident.snoozed_until, Some(at) if at <= now) {
            return Ok(false);
        }
        incident.status = IncidentStatus::Open;
        incident.snoozed_until = None;
        Ok(true)
    }

    async fn next_snooze_expiry(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let mut state = self.lock();
        state.fault("next_snooze_expiry")?;
        Ok(state
            .incidents
            .values()
            .filter(|i| i.status == IncidentStatus::Snoozed)
            .filter_map(|i| i.snoozed_until)
            .min())
    }
}
