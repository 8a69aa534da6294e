//! Periodic work the coordinator runs after the escalation and job sweeps.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use oncall_core::{TimelineEntry, TimelineKind};
use oncall_jobs::JobRunner;
use oncall_store::{with_retries, IncidentStore};

use crate::error::CoordinatorError;

/// A unit of maintenance run inside a tick.
///
/// Sweeps registered per tick run every time the coordinator holds the
/// lease; daily ones run once per calendar day.
#[async_trait]
pub trait MaintenanceSweep: Send + Sync {
    /// Name used in logs and the lease's error column.
    fn name(&self) -> &str;

    /// Run the sweep and return how many items it handled.
    async fn run(&self, now: DateTime<Utc>) -> Result<usize, CoordinatorError>;

    /// Earliest time this sweep will have work, if known. Feeds the
    /// coordinator's wake-up computation.
    async fn next_due(&self) -> Result<Option<DateTime<Utc>>, CoordinatorError> {
        Ok(None)
    }
}

// ── Auto-unsnooze ────────────────────────────────────────────

/// Reopens snoozed incidents whose snooze has expired.
pub struct UnsnoozeSweep {
    incidents: Arc<dyn IncidentStore>,
    max_tx_retries: u32,
}

impl UnsnoozeSweep {
    pub fn new(incidents: Arc<dyn IncidentStore>) -> Self {
        Self {
            incidents,
            max_tx_retries: 3,
        }
    }

    pub fn with_tx_retries(mut self, max_tx_retries: u32) -> Self {
        self.max_tx_retries = max_tx_retries;
        self
    }
}

#[async_trait]
impl MaintenanceSweep for UnsnoozeSweep {
    fn name(&self) -> &str {
        "auto_unsnooze"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<usize, CoordinatorError> {
        let reopened = with_retries(self.max_tx_retries, "unsnooze due incidents", || {
            self.incidents.unsnooze_due(now)
        })
        .await?;

        for id in &reopened {
            let entry = TimelineEntry::new(*id, TimelineKind::Unsnoozed, "Snooze expired, incident reopened", now);
            with_retries(self.max_tx_retries, "append timeline", || {
                self.incidents.append_timeline(entry.clone())
            })
            .await?;
        }
        if !reopened.is_empty() {
            info!(count = reopened.len(), "Reopened snoozed incidents");
        }
        Ok(reopened.len())
    }

    async fn next_due(&self) -> Result<Option<DateTime<Utc>>, CoordinatorError> {
        Ok(self.incidents.next_snooze_expiry().await?)
    }
}

// ── Job retention ────────────────────────────────────────────

/// Purges finished jobs past the configured retention window.
pub struct JobRetentionSweep {
    jobs: Arc<JobRunner>,
}

impl JobRetentionSweep {
    pub fn new(jobs: Arc<JobRunner>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl MaintenanceSweep for JobRetentionSweep {
    fn name(&self) -> &str {
        "job_retention"
    }

    async fn run(&self, _now: DateTime<Utc>) -> Result<usize, CoordinatorError> {
        let purged = self.jobs.cleanup(self.jobs.retention_days()).await?;
        Ok(usize::try_from(purged).unwrap_or(usize::MAX))
    }
}
