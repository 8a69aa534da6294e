use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use oncall_core::config::SchedulerConfig;
use oncall_core::{Clock, SchedulerLease};
use oncall_escalation::{EscalationEngine, EscalationSweepReport};
use oncall_jobs::{JobRunner, JobSweepReport};
use oncall_store::{with_retries, LeaseRelease, LeaseStore};

use crate::error::CoordinatorError;
use crate::sweeps::MaintenanceSweep;

/// Collaborators shared by every tick.
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub engine: Arc<EscalationEngine>,
    pub jobs: Arc<JobRunner>,
    pub lease: Arc<dyn LeaseStore>,
    pub clock: Arc<dyn Clock>,
}

/// One maintenance sweep's result inside a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepRun {
    pub name: String,
    pub handled: usize,
}

/// What one tick did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub escalations: EscalationSweepReport,
    pub jobs: JobSweepReport,
    pub sweeps: Vec<SweepRun>,
    pub daily: Vec<SweepRun>,
    /// One line per sweep that failed. A failed sweep never stops the next.
    pub errors: Vec<String>,
    pub next_wake_in: Duration,
}

impl TickReport {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }

    fn record_error(&mut self, sweep: &str, err: impl std::fmt::Display) {
        error!(sweep, error = %err, "Sweep failed");
        self.errors.push(format!("{sweep}: {err}"));
    }
}

#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// Another worker holds the lease.
    NotLeader,
    Ran(TickReport),
}

/// Elects one active scheduler among all worker processes and wakes it when
/// work is due.
pub struct Coordinator {
    deps: CoordinatorDeps,
    config: SchedulerConfig,
    max_tx_retries: u32,
    /// Run every tick, after the escalation and job sweeps.
    sweeps: Vec<Arc<dyn MaintenanceSweep>>,
    /// Run at or after `daily_hour` until they all succeed for the day.
    daily: Vec<Arc<dyn MaintenanceSweep>>,
    shutdown: Notify,
    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(deps: CoordinatorDeps, config: SchedulerConfig) -> Self {
        Self {
            deps,
            config,
            max_tx_retries: 3,
            sweeps: Vec::new(),
            daily: Vec::new(),
            shutdown: Notify::new(),
            running: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub fn with_tx_retries(mut self, max_tx_retries: u32) -> Self {
        self.max_tx_retries = max_tx_retries;
        self
    }

    /// Register a sweep that runs on every tick, in registration order.
    pub fn register_sweep(&mut self, sweep: Arc<dyn MaintenanceSweep>) {
        info!("Registered sweep: {}", sweep.name());
        self.sweeps.push(sweep);
    }

    /// Register a sweep that runs once per day.
    pub fn register_daily(&mut self, sweep: Arc<dyn MaintenanceSweep>) {
        info!("Registered daily task: {}", sweep.name());
        self.daily.push(sweep);
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    // ── Lifecycle ────────────────────────────────────────────

    /// Spawn this process's timer task. Does nothing when the coordinator
    /// is disabled or already running.
    pub fn start(self: &Arc<Self>) {
        if self.config.disabled {
            info!("Coordinator disabled, ticks must be driven externally");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Coordinator already running");
            return;
        }
        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move { coordinator.run_loop().await });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Signal the timer task and wait for it. An in-flight tick finishes
    /// first.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(worker_id = %self.config.worker_id, "Coordinator shutdown requested");
        self.shutdown.notify_one();
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Coordinator task ended abnormally");
            }
        }
    }

    async fn run_loop(self: Arc<Self>) {
        info!(
            worker_id = %self.config.worker_id,
            sweeps = self.sweeps.len(),
            daily = self.daily.len(),
            "Coordinator started"
        );
        loop {
            // Each tick runs as its own task so a panicking sweep cannot
            // take the loop down with it.
            let tick = tokio::spawn({
                let coordinator = Arc::clone(&self);
                async move { coordinator.run_tick().await }
            });
            let delay = match tick.await {
                Ok(Ok(TickOutcome::Ran(report))) => report.next_wake_in,
                Ok(Ok(TickOutcome::NotLeader)) => self.config.lease_retry(),
                Ok(Err(e)) => {
                    warn!(error = %e, "Could not take the scheduler lease");
                    self.config.lease_retry()
                }
                Err(e) => {
                    error!(error = %e, "Tick aborted");
                    self.release_after_abort(&e).await;
                    self.config.lease_retry()
                }
            };
            debug!(delay_ms = delay.as_millis() as u64, "Coordinator sleeping");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.notified() => break,
            }
        }
        info!(worker_id = %self.config.worker_id, "Coordinator stopped");
    }

    /// Hand the lease back after a tick that never reached its own release.
    /// A no-op when this worker no longer holds it.
    async fn release_after_abort(&self, cause: &JoinError) {
        let release = LeaseRelease {
            ran_at: self.deps.clock.now(),
            succeeded: false,
            error: Some(format!("tick aborted: {cause}")),
            next_run_at: None,
        };
        let holder = self.config.worker_id.as_str();
        if let Err(e) = with_retries(self.max_tx_retries, "release lease", || {
            self.deps.lease.release_lease(holder, release.clone())
        })
        .await
        {
            warn!(error = %e, "Failed to release scheduler lease, it will go stale");
        }
    }

    // ── Tick ─────────────────────────────────────────────────

    /// Run one lease-guarded tick. Also the entry point for deployments
    /// that drive ticks from an external cron.
    ///
    /// Returns `Err` only when the lease itself cannot be read or written;
    /// sweep failures are collected in the report and the lease is always
    /// released afterwards.
    pub async fn run_tick(&self) -> Result<TickOutcome, CoordinatorError> {
        let holder = self.config.worker_id.as_str();
        let now = self.deps.clock.now();
        let stale_before = now - self.config.lease_timeout();

        let acquired = with_retries(self.max_tx_retries, "acquire lease", || {
            self.deps.lease.acquire_lease(holder, now, stale_before)
        })
        .await?;
        if !acquired {
            debug!(worker_id = holder, "Lease held by another worker");
            return Ok(TickOutcome::NotLeader);
        }

        let mut report = TickReport::default();
        self.run_sweeps(now, &mut report).await;

        let finished = self.deps.clock.now();
        report.next_wake_in = self.compute_next_wake(finished).await;
        let next_run_at = chrono::Duration::from_std(report.next_wake_in)
            .map(|d| finished + d)
            .unwrap_or(finished);

        let release = LeaseRelease {
            ran_at: now,
            succeeded: report.succeeded(),
            error: (!report.succeeded()).then(|| report.errors.join("; ")),
            next_run_at: Some(next_run_at),
        };
        if let Err(e) = with_retries(self.max_tx_retries, "release lease", || {
            self.deps.lease.release_lease(holder, release.clone())
        })
        .await
        {
            warn!(error = %e, "Failed to release scheduler lease, it will go stale");
        }

        info!(
            escalated = report.escalations.escalated,
            jobs = report.jobs.claimed,
            errors = report.errors.len(),
            next_wake_ms = report.next_wake_in.as_millis() as u64,
            "Tick finished"
        );
        Ok(TickOutcome::Ran(report))
    }

    /// Fixed order: escalations first, so jobs they enqueue are visible to
    /// the job sweep in the same tick.
    async fn run_sweeps(&self, now: DateTime<Utc>, report: &mut TickReport) {
        match self.deps.engine.process_pending().await {
            Ok(r) => report.escalations = r,
            Err(e) => report.record_error("escalations", e),
        }
        match self.deps.jobs.process_due().await {
            Ok(r) => report.jobs = r,
            Err(e) => report.record_error("jobs", e),
        }
        for sweep in &self.sweeps {
            match sweep.run(now).await {
                Ok(handled) => report.sweeps.push(SweepRun {
                    name: sweep.name().to_string(),
                    handled,
                }),
                Err(e) => report.record_error(sweep.name(), e),
            }
        }

        if self.daily.is_empty() || now.hour() < self.config.daily_hour {
            return;
        }
        let today = now.date_naive();
        let last_daily = match with_retries(self.max_tx_retries, "read lease", || self.deps.lease.lease()).await {
            Ok(lease) => lease.last_daily_run,
            Err(e) => return report.record_error("daily", e),
        };
        if matches!(last_daily, Some(last) if last >= today) {
            return;
        }

        // The day is only recorded once every task succeeds, so a failed
        // task runs again on the next tick.
        info!(date = %today, "Running daily tasks");
        let failures = report.errors.len();
        for task in &self.daily {
            match task.run(now).await {
                Ok(handled) => report.daily.push(SweepRun {
                    name: task.name().to_string(),
                    handled,
                }),
                Err(e) => report.record_error(task.name(), e),
            }
        }
        if report.errors.len() > failures {
            warn!(date = %today, "Daily tasks incomplete, retrying next tick");
            return;
        }
        if let Err(e) = with_retries(self.max_tx_retries, "record daily run", || {
            self.deps.lease.record_daily_run(today)
        })
        .await
        {
            report.record_error("daily", e);
        }
    }

    // ── Wake-up ──────────────────────────────────────────────

    /// Delay until the nearest pending work, clamped to the configured
    /// range. Falls back to the maximum when idle or when the lookup fails.
    pub async fn compute_next_wake(&self, now: DateTime<Utc>) -> Duration {
        let min = self.config.min_delay();
        let max = self.config.max_delay();
        match self.earliest_due().await {
            Ok(Some(at)) => {
                let until = (at - now).to_std().unwrap_or(Duration::ZERO);
                until.max(min).min(max)
            }
            Ok(None) => max,
            Err(e) => {
                warn!(error = %e, "Next-wake lookup failed, using maximum delay");
                max
            }
        }
    }

    async fn earliest_due(&self) -> Result<Option<DateTime<Utc>>, CoordinatorError> {
        let mut candidates = vec![self.deps.engine.next_due().await?, self.deps.jobs.next_due().await?];
        for sweep in &self.sweeps {
            candidates.push(sweep.next_due().await?);
        }
        Ok(candidates.into_iter().flatten().min())
    }

    /// Lease bookkeeping: current holder, last run, last success and error,
    /// next planned run.
    pub async fn status(&self) -> Result<SchedulerLease, CoordinatorError> {
        Ok(self.deps.lease.lease().await?)
    }
}
