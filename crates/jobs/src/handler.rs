use async_trait::async_trait;
use chrono::{DateTime, Utc};

use oncall_core::{BackgroundJob, JobType};

use crate::error::JobError;

/// What a handler decided about one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Done,
    /// Too early. The job goes back to pending at `run_at` without
    /// spending an attempt.
    NotReady { run_at: DateTime<Utc> },
    /// The condition that triggered the job no longer holds.
    Cancelled { reason: String },
    /// Counts as a failed attempt and backs off.
    Failed { error: String },
}

/// Executes jobs of one type. Returning `Err` is treated like
/// [`HandlerOutcome::Failed`].
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn handle(&self, job: &BackgroundJob) -> Result<HandlerOutcome, JobError>;
}
