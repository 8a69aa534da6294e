//! Claims, executes and settles background jobs.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use oncall_core::config::JobsConfig;
use oncall_core::{BackgroundJob, Clock, JobType, NewJob};
use oncall_store::{with_retries, JobStore};

use crate::backoff::backoff_delay;
use crate::error::JobError;
use crate::handler::{HandlerOutcome, JobHandler};

/// Where a failed job ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Retrying { run_at: DateTime<Utc> },
    Exhausted,
}

/// Counts from one [`JobRunner::process_due`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSweepReport {
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub deferred: usize,
    /// Jobs whose outcome could not be written back.
    pub errors: usize,
    /// Jobs found stuck in processing and requeued or failed.
    pub recovered: usize,
}

pub struct JobRunner {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    config: JobsConfig,
    max_tx_retries: u32,
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl JobRunner {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, config: JobsConfig) -> Self {
        Self {
            store,
            clock,
            config,
            max_tx_retries: 1,
            handlers: HashMap::new(),
        }
    }

    /// Immediate retries for transient store errors on each store call.
    pub fn with_tx_retries(mut self, max_tx_retries: u32) -> Self {
        self.max_tx_retries = max_tx_retries;
        self
    }

    /// Register the handler for its job type, replacing any earlier one.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        let job_type = handler.job_type();
        info!(job_type = %job_type, "Registered job handler");
        self.handlers.insert(job_type, handler);
    }

    pub fn handles(&self, job_type: &JobType) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Insert a pending job with the configured attempt budget.
    pub async fn enqueue<P: Serialize>(
        &self,
        job_type: JobType,
        run_at: DateTime<Utc>,
        payload: &P,
    ) -> Result<BackgroundJob, JobError> {
        let new_job = NewJob::new(job_type, run_at, payload, self.config.max_attempts)?;
        let now = self.clock.now();
        let job = with_retries(self.max_tx_retries, "enqueue job", || self.store.enqueue(new_job.clone(), now)).await?;
        debug!(job_id = %job.id, job_type = %job.job_type, run_at = %job.run_at, "Job enqueued");
        Ok(job)
    }

    pub async fn claim(&self, limit: u32, job_type: Option<&JobType>) -> Result<Vec<BackgroundJob>, JobError> {
        let now = self.clock.now();
        Ok(with_retries(self.max_tx_retries, "claim jobs", || self.store.claim(limit, job_type, now)).await?)
    }

    /// Run the handler registered for the job's type.
    pub async fn execute(&self, job: &BackgroundJob) -> Result<HandlerOutcome, JobError> {
        let handler = self
            .handlers
            .get(&job.job_type)
            .ok_or_else(|| JobError::UnknownType(job.job_type.to_string()))?;
        handler.handle(job).await
    }

    pub async fn mark_completed(&self, job: &BackgroundJob) -> Result<(), JobError> {
        let now = self.clock.now();
        with_retries(self.max_tx_retries, "complete job", || self.store.complete(job.id, now)).await?;
        Ok(())
    }

    /// Back off and return the job to pending, or fail it for good once its
    /// attempt budget is spent. `job.attempts` already counts the attempt
    /// that just failed.
    pub async fn mark_failed(&self, job: &BackgroundJob, error: &str) -> Result<FailureDisposition, JobError> {
        let now = self.clock.now();
        if job.attempts >= job.max_attempts {
            with_retries(self.max_tx_retries, "fail job", || self.store.fail(job.id, error, now)).await?;
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempts = job.attempts,
                error,
                "Job failed permanently"
            );
            return Ok(FailureDisposition::Exhausted);
        }

        let run_at = now + backoff_delay(job.attempts, self.config.backoff_base_secs, self.config.backoff_max_secs);
        with_retries(self.max_tx_retries, "retry job", || self.store.retry(job.id, run_at, error)).await?;
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            max_attempts = job.max_attempts,
            %run_at,
            error,
            "Job failed, retry scheduled"
        );
        Ok(FailureDisposition::Retrying { run_at })
    }

    /// Return jobs abandoned in processing to pending, or fail them when
    /// their attempt budget is spent.
    pub async fn requeue_stale(&self) -> Result<u64, JobError> {
        let now = self.clock.now();
        let stale_before = now - self.config.processing_timeout();
        let moved = with_retries(self.max_tx_retries, "requeue stale jobs", || {
            self.store.requeue_stale(stale_before, now)
        })
        .await?;
        if moved > 0 {
            warn!(moved, stale_before = %stale_before, "Recovered jobs stuck in processing");
        }
        Ok(moved)
    }

    /// Recover stale jobs, then claim one batch of due jobs and settle
    /// each. A failure settling one job is logged and does not stop the
    /// rest of the batch.
    pub async fn process_due(&self) -> Result<JobSweepReport, JobError> {
        let recovered = self.requeue_stale().await?;
        let jobs = self.claim(self.config.batch_size, None).await?;
        let mut report = JobSweepReport {
            claimed: jobs.len(),
            recovered: recovered as usize,
            ..Default::default()
        };

        for job in &jobs {
            if let Err(e) = self.settle(job, &mut report).await {
                report.errors += 1;
                warn!(job_id = %job.id, job_type = %job.job_type, error = %e, "Failed to record job outcome");
            }
        }

        if report.claimed > 0 || report.recovered > 0 {
            info!(
                recovered = report.recovered,
                claimed = report.claimed,
                completed = report.completed,
                retried = report.retried,
                failed = report.failed,
                cancelled = report.cancelled,
                deferred = report.deferred,
                "Job sweep finished"
            );
        }
        Ok(report)
    }

    async fn settle(&self, job: &BackgroundJob, report: &mut JobSweepReport) -> Result<(), JobError> {
        let outcome = match self.execute(job).await {
            Ok(outcome) => outcome,
            Err(e) => HandlerOutcome::Failed { error: e.to_string() },
        };

        match outcome {
            HandlerOutcome::Done => {
                self.mark_completed(job).await?;
                report.completed += 1;
            }
            HandlerOutcome::NotReady { run_at } => {
                with_retries(self.max_tx_retries, "reschedule job", || self.store.reschedule(job.id, run_at)).await?;
                debug!(job_id = %job.id, %run_at, "Job not ready, rescheduled");
                report.deferred += 1;
            }
            HandlerOutcome::Cancelled { reason } => {
                let now = self.clock.now();
                with_retries(self.max_tx_retries, "cancel job", || self.store.cancel(job.id, &reason, now)).await?;
                info!(job_id = %job.id, job_type = %job.job_type, reason = %reason, "Job cancelled");
                report.cancelled += 1;
            }
            HandlerOutcome::Failed { error } => match self.mark_failed(job, &error).await? {
                FailureDisposition::Retrying { .. } => report.retried += 1,
                FailureDisposition::Exhausted => report.failed += 1,
            },
        }
        Ok(())
    }

    /// Purge completed and cancelled jobs older than `older_than_days`.
    pub async fn cleanup(&self, older_than_days: u32) -> Result<u64, JobError> {
        let horizon = self.clock.now() - Duration::days(i64::from(older_than_days));
        let purged = with_retries(self.max_tx_retries, "cleanup jobs", || self.store.cleanup(horizon)).await?;
        if purged > 0 {
            info!(purged, older_than_days, "Purged old jobs");
        }
        Ok(purged)
    }

    /// Earliest of the next pending run and the moment the oldest
    /// processing job turns stale.
    pub async fn next_due(&self) -> Result<Option<DateTime<Utc>>, JobError> {
        let pending = self.store.next_job_due().await?;
        let stale = self
            .store
            .oldest_processing_start()
            .await?
            .map(|started| started + self.config.processing_timeout());
        Ok(pending.into_iter().chain(stale).min())
    }

    pub fn retention_days(&self) -> u32 {
        self.config.retention_days
    }
}
