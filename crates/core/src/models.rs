//! Records the escalation engine reads and writes.
//!
//! Only the fields the engine touches are modelled here. Everything is
//! plain data: persistence lives in `oncall-store`, computation in the
//! rotation and escalation crates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum stored
/// as text in the database.
macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(CoreError::InvalidEnum {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// ── Incidents ─────────────────────────────────────────────────

/// Lifecycle status of an incident as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    Snoozed,
    Acknowledged,
    Resolved,
    Suppressed,
}

text_enum!(IncidentStatus, "incident status", {
    Open => "open",
    Snoozed => "snoozed",
    Acknowledged => "acknowledged",
    Resolved => "resolved",
    Suppressed => "suppressed",
});

impl IncidentStatus {
    /// Only open and snoozed incidents keep escalating. Changing the status
    /// to anything else is enough to halt the policy.
    pub fn is_escalatable(&self) -> bool {
        matches!(self, Self::Open | Self::Snoozed)
    }
}

/// Where an incident is in its escalation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationState {
    #[default]
    NotStarted,
    Escalating,
    Paused,
    Completed,
}

text_enum!(EscalationState, "escalation state", {
    NotStarted => "not_started",
    Escalating => "escalating",
    Paused => "paused",
    Completed => "completed",
});

impl EscalationState {
    /// States from which a worker may claim the next step.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::NotStarted | Self::Escalating)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub title: String,
    pub status: IncidentStatus,
    pub service_id: Uuid,
    pub assignee_id: Option<Uuid>,
    pub team_id: Option<Uuid>,
    pub snoozed_until: Option<DateTime<Utc>>,
    pub escalation: EscalationState,
    /// Index of the policy step that fires next. `None` for incidents that
    /// have never escalated.
    pub step_index: Option<usize>,
    pub next_escalation_at: Option<DateTime<Utc>>,
    /// Processing lock. Set while one worker executes a step.
    pub processing_started_at: Option<DateTime<Utc>>,
}

impl Incident {
    /// A fresh open incident that has not started escalating.
    pub fn new(title: impl Into<String>, service_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            status: IncidentStatus::Open,
            service_id,
            assignee_id: None,
            team_id: None,
            snoozed_until: None,
            escalation: EscalationState::NotStarted,
            step_index: None,
            next_escalation_at: None,
            processing_started_at: None,
        }
    }

    pub fn is_unassigned(&self) -> bool {
        self.assignee_id.is_none() && self.team_id.is_none()
    }
}

// ── Escalation policies ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    User,
    Team,
    Schedule,
}

text_enum!(TargetType, "target type", {
    User => "user",
    Team => "team",
    Schedule => "schedule",
});

/// Delivery channel. The engine never looks inside a channel; it only
/// hands it to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Push,
    Chat,
    Webhook,
}

text_enum!(Channel, "channel", {
    Email => "email",
    Sms => "sms",
    Push => "push",
    Chat => "chat",
    Webhook => "webhook",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationStep {
    pub order: u32,
    /// Minutes to wait before this step fires.
    pub delay_minutes: u32,
    pub target_type: TargetType,
    pub target_id: Option<Uuid>,
    pub notify_team_lead_only: bool,
    /// Overrides per-user channel preferences when non-empty.
    pub channels: Vec<Channel>,
}

impl EscalationStep {
    pub fn delay(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.delay_minutes))
    }
}

// ── Directory ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamMember {
    pub user_id: Uuid,
    /// False when the member opted out of team-wide notifications.
    pub team_notifications: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    pub lead_id: Option<Uuid>,
    pub members: Vec<TeamMember>,
}

// ── On-call schedules ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerMember {
    pub user_id: Uuid,
    pub position: u32,
}

/// One rotating cast of on-call users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnCallLayer {
    pub id: Uuid,
    pub name: String,
    pub start: DateTime<Utc>,
    /// `None` means the layer never ends.
    pub end: Option<DateTime<Utc>>,
    pub rotation_hours: i64,
    pub members: Vec<LayerMember>,
}

/// A manual, time-bounded substitution independent of rotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnCallOverride {
    pub id: Uuid,
    pub user_id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Only blocks currently assigned to this user are replaced.
    pub replaces_user_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub layers: Vec<OnCallLayer>,
    pub overrides: Vec<OnCallOverride>,
}

// ── Background jobs ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

text_enum!(JobStatus, "job status", {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Job type tag. Unknown tags survive a round-trip through the store so a
/// newer worker's jobs are not lost by an older one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum JobType {
    EscalationStep,
    Notification,
    AutoUnsnooze,
    Other(String),
}

impl JobType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::EscalationStep => "escalation_step",
            Self::Notification => "notification",
            Self::AutoUnsnooze => "auto_unsnooze",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for JobType {
    fn from(s: &str) -> Self {
        match s {
            "escalation_step" => Self::EscalationStep,
            "notification" => Self::Notification,
            "auto_unsnooze" => Self::AutoUnsnooze,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for JobType {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<JobType> for String {
    fn from(t: JobType) -> Self {
        t.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundJob {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub run_at: DateTime<Utc>,
    /// Interpreted by the handler registered for `job_type`.
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl BackgroundJob {
    /// Decode the payload into the handler's typed shape.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, CoreError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| CoreError::InvalidPayload(format!("{} job {}: {}", self.job_type, self.id, e)))
    }
}

/// Insert request for the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: JobType,
    pub run_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn new<P: Serialize>(
        job_type: JobType,
        run_at: DateTime<Utc>,
        payload: &P,
        max_attempts: u32,
    ) -> Result<Self, CoreError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| CoreError::InvalidPayload(e.to_string()))?;
        Ok(Self {
            job_type,
            run_at,
            payload,
            max_attempts,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationStepPayload {
    pub incident_id: Uuid,
    pub step_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsnoozePayload {
    pub incident_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub incident_id: Uuid,
    pub user_id: Uuid,
    pub channel: Channel,
    pub message: String,
}

// ── Scheduler lease ───────────────────────────────────────────

/// The singleton row that elects the active scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerLease {
    pub holder: Option<String>,
    pub held_since: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_daily_run: Option<NaiveDate>,
}

// ── Timeline ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineKind {
    EscalationScheduled,
    EscalationStep,
    EscalationSkipped,
    EscalationCompleted,
    EscalationFailed,
    Assigned,
    NotificationFailed,
    Unsnoozed,
}

text_enum!(TimelineKind, "timeline kind", {
    EscalationScheduled => "escalation_scheduled",
    EscalationStep => "escalation_step",
    EscalationSkipped => "escalation_skipped",
    EscalationCompleted => "escalation_completed",
    EscalationFailed => "escalation_failed",
    Assigned => "assigned",
    NotificationFailed => "notification_failed",
    Unsnoozed => "unsnoozed",
});

/// Human-readable note attached to an incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub incident_id: Uuid,
    pub kind: TimelineKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl TimelineEntry {
    pub fn new(incident_id: Uuid, kind: TimelineKind, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            incident_id,
            kind,
            message: message.into(),
            at,
        }
    }
}
