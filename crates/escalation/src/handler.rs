//! Job handler that continues a delayed escalation step.

use std::sync::Arc;

use async_trait::async_trait;

use oncall_core::{BackgroundJob, EscalationStepPayload, JobType};
use oncall_jobs::{HandlerOutcome, JobError, JobHandler};

use crate::engine::{EscalationEngine, EscalationOutcome};
use crate::error::EscalationError;

pub struct EscalationStepHandler {
    engine: Arc<EscalationEngine>,
}

impl EscalationStepHandler {
    pub fn new(engine: Arc<EscalationEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobHandler for EscalationStepHandler {
    fn job_type(&self) -> JobType {
        JobType::EscalationStep
    }

    async fn handle(&self, job: &BackgroundJob) -> Result<HandlerOutcome, JobError> {
        let payload: EscalationStepPayload = job.payload_as()?;
        let Some(incident) = self.engine.incidents().get_incident(payload.incident_id).await? else {
            return Ok(HandlerOutcome::Cancelled {
                reason: "incident not found".to_string(),
            });
        };
        if !incident.status.is_escalatable() {
            return Ok(HandlerOutcome::Cancelled {
                reason: format!("incident is {}", incident.status),
            });
        }
        let stored = incident.step_index.unwrap_or(0);
        if stored != payload.step_index {
            return Ok(HandlerOutcome::Cancelled {
                reason: format!("incident moved on to step {}", stored + 1),
            });
        }

        let now = self.engine.clock().now();
        match self.engine.execute(payload.incident_id, Some(payload.step_index)).await {
            Ok(EscalationOutcome::Scheduled { run_at }) if run_at > now => Ok(HandlerOutcome::NotReady { run_at }),
            Ok(_) => Ok(HandlerOutcome::Done),
            Err(EscalationError::Store(e)) => Err(JobError::Store(e)),
            Err(EscalationError::Payload(e)) => Err(JobError::Payload(e)),
            Err(e @ EscalationError::IncidentNotFound(_)) => Ok(HandlerOutcome::Cancelled { reason: e.to_string() }),
        }
    }
}
