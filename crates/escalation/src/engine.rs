//! Per-incident step execution and the pending-escalation sweep.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use oncall_core::config::EngineConfig;
use oncall_core::{
    Channel, Clock, EscalationState, EscalationStep, EscalationStepPayload, Incident, JobType, NewJob,
    NotificationPayload, TargetType, TimelineEntry, TimelineKind,
};
use oncall_notify::templating::MessageContext;
use oncall_notify::{MessageRenderer, NotificationDispatcher};
use oncall_store::{with_retries, Directory, EscalationAdvance, IncidentStore, JobStore};

use crate::error::EscalationError;
use crate::targets::{resolve_target, Target};

/// Result of one [`EscalationEngine::execute`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationOutcome {
    /// No policy, a paused policy, or an incident that no longer escalates.
    NotEscalated,
    Completed,
    /// The step waits for its delay.
    Scheduled { run_at: DateTime<Utc> },
    /// Another worker holds this step.
    InProgress,
    Escalated {
        step_index: usize,
        notified: usize,
        next_step: Option<usize>,
    },
}

/// Counts from one [`EscalationEngine::process_pending`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EscalationSweepReport {
    pub processed: usize,
    pub escalated: usize,
    /// Transient failures left for the next sweep.
    pub retried: usize,
    /// Fatal failures whose escalation was ended.
    pub forced_complete: usize,
}

/// Collaborators the engine needs. The same store usually backs all three
/// store traits.
#[derive(Clone)]
pub struct EngineDeps {
    pub incidents: Arc<dyn IncidentStore>,
    pub directory: Arc<dyn Directory>,
    pub jobs: Arc<dyn JobStore>,
    pub dispatcher: Arc<dyn NotificationDispatcher>,
    pub clock: Arc<dyn Clock>,
}

pub struct EscalationEngine {
    deps: EngineDeps,
    config: EngineConfig,
    default_channel: Channel,
    job_max_attempts: u32,
    renderer: MessageRenderer,
}

impl EscalationEngine {
    pub fn new(deps: EngineDeps, config: EngineConfig) -> Self {
        Self {
            deps,
            config,
            default_channel: Channel::Email,
            job_max_attempts: 3,
            renderer: MessageRenderer::default(),
        }
    }

    /// Channel used for users with no stored preference.
    pub fn with_default_channel(mut self, channel: Channel) -> Self {
        self.default_channel = channel;
        self
    }

    /// Attempt budget for jobs the engine enqueues.
    pub fn with_job_max_attempts(mut self, max_attempts: u32) -> Self {
        self.job_max_attempts = max_attempts;
        self
    }

    pub fn with_renderer(mut self, renderer: MessageRenderer) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.deps.clock
    }

    pub fn incidents(&self) -> &Arc<dyn IncidentStore> {
        &self.deps.incidents
    }

    fn retries(&self) -> u32 {
        self.config.max_tx_retries
    }

    /// Run the incident's current step, or `step_index` when given.
    ///
    /// Safe to call concurrently: a delayed step creates one timer, and a
    /// due step is claimed by exactly one caller. Every path that took the
    /// processing lock releases it before returning.
    pub async fn execute(&self, incident_id: Uuid, step_index: Option<usize>) -> Result<EscalationOutcome, EscalationError> {
        let store = &self.deps.incidents;
        let now = self.deps.clock.now();

        let incident = with_retries(self.retries(), "load incident", || store.get_incident(incident_id))
            .await?
            .ok_or(EscalationError::IncidentNotFound(incident_id))?;
        let steps = with_retries(self.retries(), "load policy", || store.policy_steps(incident.service_id)).await?;

        if steps.is_empty() {
            with_retries(self.retries(), "clear escalation", || store.clear_escalation(incident_id)).await?;
            debug!(incident_id = %incident_id, "No escalation policy, nothing to do");
            return Ok(EscalationOutcome::NotEscalated);
        }
        match incident.escalation {
            EscalationState::Completed => return Ok(EscalationOutcome::Completed),
            EscalationState::Paused => return Ok(EscalationOutcome::NotEscalated),
            EscalationState::NotStarted | EscalationState::Escalating => {}
        }
        if !incident.status.is_escalatable() {
            debug!(incident_id = %incident_id, status = %incident.status, "Incident no longer escalates");
            return Ok(EscalationOutcome::NotEscalated);
        }

        let index = step_index.or(incident.step_index).unwrap_or(0);
        if index >= steps.len() {
            with_retries(self.retries(), "complete escalation", || store.complete_escalation(incident_id)).await?;
            info!(incident_id = %incident_id, step_index = index, "Step past end of policy, escalation completed");
            return Ok(EscalationOutcome::Completed);
        }

        let step = &steps[index];
        if step.delay_minutes > 0 {
            match incident.next_escalation_at {
                Some(at) if at > now => return Ok(EscalationOutcome::Scheduled { run_at: at }),
                None => return self.schedule(&incident, step, index, now).await,
                Some(_) => {}
            }
        }

        let stale_before = now - self.config.lock_timeout();
        let claimed = with_retries(self.retries(), "claim step", || {
            store.claim_step(incident_id, index, now, stale_before)
        })
        .await?;
        if !claimed {
            debug!(incident_id = %incident_id, step_index = index, "Step held by another worker");
            return Ok(EscalationOutcome::InProgress);
        }

        match self.run_claimed(&incident, &steps, index, now).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Err(release_err) = store.release_lock(incident_id).await {
                    warn!(incident_id = %incident_id, error = %release_err, "Failed to release processing lock");
                }
                Err(e)
            }
        }
    }

    /// Start the timer for a delayed step. Only the caller whose conditional
    /// update lands enqueues the continuation job.
    async fn schedule(
        &self,
        incident: &Incident,
        step: &EscalationStep,
        index: usize,
        now: DateTime<Utc>,
    ) -> Result<EscalationOutcome, EscalationError> {
        let store = &self.deps.incidents;
        let run_at = now + step.delay();
        let won = with_retries(self.retries(), "schedule step", || store.schedule_step(incident.id, index, run_at)).await?;
        if !won {
            let current = store.get_incident(incident.id).await?;
            let run_at = current.and_then(|i| i.next_escalation_at).unwrap_or(run_at);
            return Ok(EscalationOutcome::Scheduled { run_at });
        }

        let job = NewJob::new(
            JobType::EscalationStep,
            run_at,
            &EscalationStepPayload {
                incident_id: incident.id,
                step_index: index,
            },
            self.job_max_attempts,
        )?;
        with_retries(self.retries(), "enqueue escalation job", || self.deps.jobs.enqueue(job.clone(), now)).await?;
        self.note(
            incident.id,
            TimelineKind::EscalationScheduled,
            format!("Step {} scheduled for {} ({} min delay)", index + 1, run_at.to_rfc3339(), step.delay_minutes),
            now,
        )
        .await?;
        info!(incident_id = %incident.id, step_index = index, %run_at, "Escalation step scheduled");
        Ok(EscalationOutcome::Scheduled { run_at })
    }

    /// Execute a claimed step. Steps with nobody to notify are skipped in
    /// a loop bounded by the policy length; the lock stays held throughout.
    async fn run_claimed(
        &self,
        incident: &Incident,
        steps: &[EscalationStep],
        mut index: usize,
        now: DateTime<Utc>,
    ) -> Result<EscalationOutcome, EscalationError> {
        let store = &self.deps.incidents;
        let id = incident.id;

        while index < steps.len() {
            let step = &steps[index];
            let target = with_retries(self.retries(), "resolve target", || {
                resolve_target(self.deps.directory.as_ref(), step, now)
            })
            .await?;

            let (user_ids, team_id) = match target {
                Target::Users { user_ids, team_id } => (user_ids, team_id),
                Target::Skip { reason } => {
                    self.note(id, TimelineKind::EscalationSkipped, format!("Step {} skipped: {}", index + 1, reason), now)
                        .await?;
                    warn!(incident_id = %id, step_index = index, reason = %reason, "Escalation step skipped");

                    let next = index + 1;
                    if next >= steps.len() {
                        return self.finish(id, index, now).await;
                    }
                    if steps[next].delay_minutes > 0 {
                        let next_at = now + steps[next].delay();
                        self.advance(id, EscalationAdvance::Next { step_index: next, next_at }).await?;
                        return Ok(EscalationOutcome::Scheduled { run_at: next_at });
                    }
                    with_retries(self.retries(), "skip step", || store.set_step_index(id, next)).await?;
                    index = next;
                    continue;
                }
            };

            if incident.is_unassigned() {
                self.assign(incident, step, &user_ids, team_id, now).await?;
            }

            let message = self.renderer.render_or_default(&MessageContext::new(incident, step, index));
            let notified = self.notify_users(id, step, &user_ids, &message, now).await?;

            let next = index + 1;
            let next_step = (next < steps.len()).then_some(next);
            self.note(
                id,
                TimelineKind::EscalationStep,
                format!("Step {} fired: notified {} of {} user(s)", index + 1, notified, user_ids.len()),
                now,
            )
            .await?;

            match next_step {
                Some(next) => {
                    let next_at = now + steps[next].delay();
                    self.advance(id, EscalationAdvance::Next { step_index: next, next_at }).await?;
                }
                None => {
                    self.finish(id, index, now).await?;
                }
            }
            info!(incident_id = %id, step_index = index, notified, next_step = ?next_step, "Escalation step executed");
            return Ok(EscalationOutcome::Escalated {
                step_index: index,
                notified,
                next_step,
            });
        }

        self.finish(id, index, now).await
    }

    async fn assign(
        &self,
        incident: &Incident,
        step: &EscalationStep,
        user_ids: &[Uuid],
        team_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<(), EscalationError> {
        let (user, team) = match step.target_type {
            TargetType::Team => (None, team_id),
            TargetType::User | TargetType::Schedule => (user_ids.first().copied(), None),
        };
        let who = match (user, team) {
            (Some(u), _) => format!("user {u}"),
            (None, Some(t)) => format!("team {t}"),
            (None, None) => return Ok(()),
        };
        let store = &self.deps.incidents;
        let assigned = with_retries(self.retries(), "assign incident", || {
            store.assign_if_unassigned(incident.id, user, team)
        })
        .await?;
        if assigned {
            self.note(incident.id, TimelineKind::Assigned, format!("Assigned to {who} by escalation"), now)
                .await?;
        }
        Ok(())
    }

    /// Send `message` to every user on every applicable channel. Returns the
    /// number of users reached on at least one channel. Failed deliveries
    /// are noted and queued as notification jobs.
    async fn notify_users(
        &self,
        incident_id: Uuid,
        step: &EscalationStep,
        user_ids: &[Uuid],
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, EscalationError> {
        let mut notified = 0;
        for &user_id in user_ids {
            let channels = self.channels_for(step, user_id).await?;
            let mut reached = false;
            for channel in channels {
                let report = self.deps.dispatcher.send(incident_id, user_id, channel, message).await;
                if report.success {
                    reached = true;
                    continue;
                }
                let reason = report.error.unwrap_or_else(|| "unknown error".to_string());
                warn!(incident_id = %incident_id, user_id = %user_id, channel = %channel, error = %reason, "Escalation notification failed");
                self.queue_redelivery(incident_id, user_id, channel, message, now).await?;
                self.note(
                    incident_id,
                    TimelineKind::NotificationFailed,
                    format!("Notifying user {user_id} via {channel} failed: {reason}; queued for retry"),
                    now,
                )
                .await?;
            }
            if reached {
                notified += 1;
            }
        }
        Ok(notified)
    }

    async fn channels_for(&self, step: &EscalationStep, user_id: Uuid) -> Result<Vec<Channel>, EscalationError> {
        if !step.channels.is_empty() {
            return Ok(step.channels.clone());
        }
        let preferred = with_retries(self.retries(), "load channel preferences", || {
            self.deps.directory.preferred_channels(user_id)
        })
        .await?;
        if preferred.is_empty() {
            Ok(vec![self.default_channel])
        } else {
            Ok(preferred)
        }
    }

    async fn queue_redelivery(
        &self,
        incident_id: Uuid,
        user_id: Uuid,
        channel: Channel,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EscalationError> {
        let job = NewJob::new(
            JobType::Notification,
            now,
            &NotificationPayload {
                incident_id,
                user_id,
                channel,
                message: message.to_string(),
            },
            self.job_max_attempts,
        )?;
        with_retries(self.retries(), "enqueue notification job", || self.deps.jobs.enqueue(job.clone(), now)).await?;
        Ok(())
    }

    async fn advance(&self, id: Uuid, advance: EscalationAdvance) -> Result<(), EscalationError> {
        let store = &self.deps.incidents;
        with_retries(self.retries(), "advance escalation", || store.advance_escalation(id, advance)).await?;
        Ok(())
    }

    async fn finish(&self, id: Uuid, last_index: usize, now: DateTime<Utc>) -> Result<EscalationOutcome, EscalationError> {
        self.note(
            id,
            TimelineKind::EscalationCompleted,
            format!("Escalation policy completed after step {}", last_index + 1),
            now,
        )
        .await?;
        self.advance(id, EscalationAdvance::Completed).await?;
        info!(incident_id = %id, "Escalation completed");
        Ok(EscalationOutcome::Completed)
    }

    async fn note(&self, id: Uuid, kind: TimelineKind, message: String, at: DateTime<Utc>) -> Result<(), EscalationError> {
        let store = &self.deps.incidents;
        let entry = TimelineEntry::new(id, kind, message, at);
        with_retries(self.retries(), "append timeline", || store.append_timeline(entry.clone())).await?;
        Ok(())
    }

    /// Execute every incident whose next step is due. Per-incident errors
    /// never abort the batch: transient ones are left for the next sweep
    /// (the failed call already dropped its lock), anything else ends the
    /// incident's escalation with a timeline note.
    pub async fn process_pending(&self) -> Result<EscalationSweepReport, EscalationError> {
        let store = &self.deps.incidents;
        let now = self.deps.clock.now();
        let stale_before = now - self.config.lock_timeout();
        let due = with_retries(self.retries(), "select due escalations", || {
            store.due_escalations(now, stale_before, self.config.batch_size)
        })
        .await?;

        let mut report = EscalationSweepReport {
            processed: due.len(),
            ..Default::default()
        };

        for incident_id in due {
            match self.execute(incident_id, None).await {
                Ok(EscalationOutcome::Escalated { .. }) => report.escalated += 1,
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    report.retried += 1;
                    warn!(incident_id = %incident_id, error = %e, "Transient escalation failure, will retry next sweep");
                }
                Err(e) => {
                    report.forced_complete += 1;
                    error!(incident_id = %incident_id, error = %e, "Escalation failed, forcing completion");
                    if let Err(force_err) = self.force_complete(incident_id, &e, now).await {
                        error!(incident_id = %incident_id, error = %force_err, "Could not force escalation completion");
                    }
                }
            }
        }

        if report.processed > 0 {
            info!(
                processed = report.processed,
                escalated = report.escalated,
                retried = report.retried,
                forced_complete = report.forced_complete,
                "Escalation sweep finished"
            );
        }
        Ok(report)
    }

    async fn force_complete(&self, id: Uuid, cause: &EscalationError, now: DateTime<Utc>) -> Result<(), EscalationError> {
        self.note(id, TimelineKind::EscalationFailed, format!("Escalation stopped after an error: {cause}"), now)
            .await?;
        self.advance(id, EscalationAdvance::Completed).await
    }

    /// Earliest pending escalation time, for the coordinator's wake-up.
    pub async fn next_due(&self) -> Result<Option<DateTime<Utc>>, EscalationError> {
        Ok(self.deps.incidents.next_escalation_due().await?)
    }
}
