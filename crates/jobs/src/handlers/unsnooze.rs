use std::sync::Arc;

use async_trait::async_trait;

use oncall_core::{BackgroundJob, Clock, IncidentStatus, JobType, TimelineEntry, TimelineKind, UnsnoozePayload};
use oncall_store::IncidentStore;

use crate::error::JobError;
use crate::handler::{HandlerOutcome, JobHandler};

/// Reopens one snoozed incident once its snooze expires.
pub struct UnsnoozeJobHandler {
    incidents: Arc<dyn IncidentStore>,
    clock: Arc<dyn Clock>,
}

impl UnsnoozeJobHandler {
    pub fn new(incidents: Arc<dyn IncidentStore>, clock: Arc<dyn Clock>) -> Self {
        Self { incidents, clock }
    }
}

#[async_trait]
impl JobHandler for UnsnoozeJobHandler {
    fn job_type(&self) -> JobType {
        JobType::AutoUnsnooze
    }

    async fn handle(&self, job: &BackgroundJob) -> Result<HandlerOutcome, JobError> {
        let payload: UnsnoozePayload = job.payload_as()?;
        let Some(incident) = self.incidents.get_incident(payload.incident_id).await? else {
            return Ok(HandlerOutcome::Cancelled {
                reason: "incident not found".to_string(),
            });
        };
        if incident.status != IncidentStatus::Snoozed {
            return Ok(HandlerOutcome::Cancelled {
                reason: format!("incident is {}, not snoozed", incident.status),
            });
        }

        let now = self.clock.now();
        match incident.snoozed_until {
            None => Ok(HandlerOutcome::Cancelled {
                reason: "snooze has no expiry".to_string(),
            }),
            Some(until) if until > now => Ok(HandlerOutcome::NotReady { run_at: until }),
            Some(_) => {
                if !self.incidents.unsnooze(incident.id, now).await? {
                    return Ok(HandlerOutcome::Cancelled {
                        reason: "incident was reopened concurrently".to_string(),
                    });
                }
                self.incidents
                    .append_timeline(TimelineEntry::new(
                        incident.id,
                        TimelineKind::Unsnoozed,
                        "Snooze expired, incident reopened",
                        now,
                    ))
                    .await?;
                tracing::info!(incident_id = %incident.id, "Incident unsnoozed");
                Ok(HandlerOutcome::Done)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use oncall_core::{Incident, JobStatus, ManualClock};
    use oncall_store::MemoryStore;
    use uuid::Uuid;

    fn job_for(incident_id: Uuid) -> BackgroundJob {
        BackgroundJob {
            id: Uuid::new_v4(),
            job_type: JobType::AutoUnsnooze,
            status: JobStatus::Processing,
            run_at: Utc::now(),
            payload: serde_json::to_value(UnsnoozePayload { incident_id }).unwrap(),
            attempts: 1,
            max_attempts: 3,
            last_error: None,
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
        }
    }

    fn setup(snooze_for: Duration) -> (Arc<MemoryStore>, Arc<ManualClock>, Uuid, UnsnoozeJobHandler) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut incident = Incident::new("disk full", Uuid::new_v4());
        incident.status = IncidentStatus::Snoozed;
        incident.snoozed_until = Some(clock.now() + snooze_for);
        let id = incident.id;
        store.insert_incident(incident);
        let handler = UnsnoozeJobHandler::new(store.clone(), clock.clone());
        (store, clock, id, handler)
    }

    #[tokio::test]
    async fn early_job_is_deferred_to_snooze_expiry() {
        let (store, clock, id, handler) = setup(Duration::minutes(30));
        let outcome = handler.handle(&job_for(id)).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::NotReady { run_at: clock.now() + Duration::minutes(30) });
        assert_eq!(store.incident(id).unwrap().status, IncidentStatus::Snoozed);
    }

    #[tokio::test]
    async fn expired_snooze_reopens_with_timeline_note() {
        let (store, clock, id, handler) = setup(Duration::minutes(30));
        clock.advance(Duration::minutes(31));
        assert_eq!(handler.handle(&job_for(id)).await.unwrap(), HandlerOutcome::Done);
        assert_eq!(store.incident(id).unwrap().status, IncidentStatus::Open);
        assert_eq!(store.timeline(id)[0].kind, TimelineKind::Unsnoozed);
    }

    #[tokio::test]
    async fn vanished_condition_cancels() {
        let (store, _clock, id, handler) = setup(Duration::minutes(30));
        store.update_incident(id, |i| i.status = IncidentStatus::Acknowledged);
        assert!(matches!(handler.handle(&job_for(id)).await.unwrap(), HandlerOutcome::Cancelled { .. }));

        let missing = handler.handle(&job_for(Uuid::new_v4())).await.unwrap();
        assert!(matches!(missing, HandlerOutcome::Cancelled { .. }));
    }
}
