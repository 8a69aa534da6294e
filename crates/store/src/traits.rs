//! Store contracts used by the engine, the job runner and the coordinator.
//!
//! Every method returning `bool` is a conditional update: `true` means this
//! caller's write took effect, `false` means the row no longer matched
//! (another worker got there first). Contention is an outcome, not an error.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use oncall_core::{
    BackgroundJob, Channel, EscalationStep, Incident, JobType, NewJob, Schedule, SchedulerLease, Team,
    TimelineEntry,
};

use crate::error::StoreResult;

/// Recorded on jobs recovered by [`JobStore::requeue_stale`].
pub const STALE_ERROR: &str = "worker stopped before recording an outcome";

/// How a claimed step ends. Both variants release the processing lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationAdvance {
    Next {
        step_index: usize,
        next_at: DateTime<Utc>,
    },
    Completed,
}

/// Bookkeeping written when the lease holder gives the lease back.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseRelease {
    pub ran_at: DateTime<Utc>,
    pub succeeded: bool,
    pub error: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait IncidentStore: Send + Sync {
    async fn get_incident(&self, id: Uuid) -> StoreResult<Option<Incident>>;

    /// Steps of the policy attached to a service, ordered. Empty when the
    /// service has no policy.
    async fn policy_steps(&self, service_id: Uuid) -> StoreResult<Vec<EscalationStep>>;

    /// Reset escalation fields to "not started".
    async fn clear_escalation(&self, id: Uuid) -> StoreResult<()>;

    /// Record a delayed step. Only succeeds while no escalation time is
    /// pending, so concurrent callers create a single timer.
    async fn schedule_step(&self, id: Uuid, step_index: usize, run_at: DateTime<Utc>) -> StoreResult<bool>;

    /// Take the processing lock for `expected_step`. Step 0 also matches an
    /// incident that has never escalated. A lock taken before `stale_before`
    /// counts as abandoned.
    async fn claim_step(
        &self,
        id: Uuid,
        expected_step: usize,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Move a claimed incident to another step without releasing the lock.
    async fn set_step_index(&self, id: Uuid, step_index: usize) -> StoreResult<()>;

    /// Assign the incident only if it still has neither assignee nor team.
    async fn assign_if_unassigned(&self, id: Uuid, user_id: Option<Uuid>, team_id: Option<Uuid>) -> StoreResult<bool>;

    async fn advance_escalation(&self, id: Uuid, advance: EscalationAdvance) -> StoreResult<()>;

    async fn complete_escalation(&self, id: Uuid) -> StoreResult<()> {
        self.advance_escalation(id, EscalationAdvance::Completed).await
    }

    /// Drop the processing lock without touching any other field.
    async fn release_lock(&self, id: Uuid) -> StoreResult<()>;

    async fn append_timeline(&self, entry: TimelineEntry) -> StoreResult<()>;

    /// Escalating, open-or-snoozed incidents whose next step is due and
    /// whose lock is empty or stale, oldest first.
    async fn due_escalations(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<Uuid>>;

    async fn next_escalation_due(&self) -> StoreResult<Option<DateTime<Utc>>>;

    /// Reopen every snoozed incident whose snooze has expired.
    async fn unsnooze_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<Uuid>>;

    /// Reopen one incident if it is snoozed and its snooze has expired.
    async fn unsnooze(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool>;

    async fn next_snooze_expiry(&self) -> StoreResult<Option<DateTime<Utc>>>;
}

/// Read-only directory lookups needed to resolve escalation targets.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn team(&self, id: Uuid) -> StoreResult<Option<Team>>;

    async fn schedule(&self, id: Uuid) -> StoreResult<Option<Schedule>>;

    /// The user's channels in preference order. Empty when unset.
    async fn preferred_channels(&self, user_id: Uuid) -> StoreResult<Vec<Channel>>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> StoreResult<BackgroundJob>;

    /// Atomically take up to `limit` due pending jobs under their attempt
    /// budget: status becomes processing, `started_at` is stamped and the
    /// attempt counter incremented. Concurrent callers get disjoint sets.
    async fn claim(
        &self,
        limit: u32,
        job_type: Option<&JobType>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<BackgroundJob>>;

    async fn complete(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<()>;

    /// Back to pending at `run_at`, keeping the consumed attempt.
    async fn retry(&self, id: Uuid, run_at: DateTime<Utc>, error: &str) -> StoreResult<()>;

    async fn fail(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> StoreResult<()>;

    async fn cancel(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> StoreResult<()>;

    /// Back to pending at `run_at`, refunding the attempt the claim consumed.
    async fn reschedule(&self, id: Uuid, run_at: DateTime<Utc>) -> StoreResult<()>;

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<BackgroundJob>>;

    /// Purge completed and cancelled jobs finished before `older_than`.
    async fn cleanup(&self, older_than: DateTime<Utc>) -> StoreResult<u64>;

    async fn next_job_due(&self) -> StoreResult<Option<DateTime<Utc>>>;

    /// Recover jobs whose worker never recorded an outcome: processing rows
    /// started before `stale_before` go back to pending at `now` while they
    /// have attempts left, and fail otherwise. Returns how many were moved.
    async fn requeue_stale(&self, stale_before: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<u64>;

    /// Earliest `started_at` among jobs still processing.
    async fn oldest_processing_start(&self) -> StoreResult<Option<DateTime<Utc>>>;
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Take or renew the singleton lease. Succeeds when it is unheld, held
    /// by `holder` already, or was last taken before `stale_before`.
    async fn acquire_lease(&self, holder: &str, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> StoreResult<bool>;

    /// Give the lease back. A no-op unless `holder` still holds it.
    async fn release_lease(&self, holder: &str, release: LeaseRelease) -> StoreResult<()>;

    async fn lease(&self) -> StoreResult<SchedulerLease>;

    /// Mark the daily tasks as run for `date`. Returns `false` when they
    /// already ran that day.
    async fn record_daily_run(&self, date: NaiveDate) -> StoreResult<bool>;
}
