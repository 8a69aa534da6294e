use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use oncall_coordinator::{
    Coordinator, CoordinatorDeps, CoordinatorError, MaintenanceSweep, TickOutcome, TickReport, UnsnoozeSweep,
};
use oncall_core::config::{EngineConfig, JobsConfig, SchedulerConfig};
use oncall_core::{
    Channel, Clock, EscalationState, EscalationStep, Incident, IncidentStatus, ManualClock, TargetType,
};
use oncall_escalation::{EngineDeps, EscalationEngine, EscalationStepHandler};
use oncall_jobs::{JobRunner, NotificationJobHandler};
use oncall_notify::RecordingDispatcher;
use oncall_store::{LeaseStore, MemoryStore, StoreError};

struct Harness {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    dispatcher: Arc<RecordingDispatcher>,
    engine: Arc<EscalationEngine>,
    jobs: Arc<JobRunner>,
    service: Uuid,
}

/// 2026-03-10 04:00 UTC, past the default daily hour.
fn morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 4, 0, 0).unwrap()
}

fn scheduler_config(worker_id: &str) -> SchedulerConfig {
    SchedulerConfig {
        disabled: false,
        min_delay_ms: 1_000,
        max_delay_ms: 60_000,
        lease_timeout_secs: 120,
        lease_retry_ms: 5_000,
        daily_hour: 3,
        worker_id: worker_id.to_string(),
    }
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(morning()));
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let engine = Arc::new(EscalationEngine::new(
        EngineDeps {
            incidents: store.clone(),
            directory: store.clone(),
            jobs: store.clone(),
            dispatcher: dispatcher.clone(),
            clock: clock.clone(),
        },
        EngineConfig::default(),
    ));
    let mut runner = JobRunner::new(store.clone(), clock.clone(), JobsConfig::default());
    runner.register(Arc::new(EscalationStepHandler::new(engine.clone())));
    runner.register(Arc::new(NotificationJobHandler::new(dispatcher.clone())));
    Harness {
        store,
        clock,
        dispatcher,
        engine,
        jobs: Arc::new(runner),
        service: Uuid::new_v4(),
    }
}

impl Harness {
    fn coordinator(&self, worker_id: &str) -> Coordinator {
        Coordinator::new(
            CoordinatorDeps {
                engine: self.engine.clone(),
                jobs: self.jobs.clone(),
                lease: self.store.clone(),
                clock: self.clock.clone(),
            },
            scheduler_config(worker_id),
        )
    }

    fn policy(&self, steps: Vec<EscalationStep>) {
        self.store.insert_policy(self.service, steps);
    }

    fn incident(&self) -> Uuid {
        let incident = Incident::new("api latency", self.service);
        let id = incident.id;
        self.store.insert_incident(incident);
        id
    }

    fn escalating(&self, step_index: usize, next_at: DateTime<Utc>) -> Uuid {
        let id = self.incident();
        self.store.update_incident(id, |i| {
            i.escalation = EscalationState::Escalating;
            i.step_index = Some(step_index);
            i.next_escalation_at = Some(next_at);
        });
        id
    }
}

fn step(delay_minutes: u32, user: Uuid, channels: Vec<Channel>) -> EscalationStep {
    EscalationStep {
        order: 1,
        delay_minutes,
        target_type: TargetType::User,
        target_id: Some(user),
        notify_team_lead_only: false,
        channels,
    }
}

fn ran(outcome: TickOutcome) -> TickReport {
    match outcome {
        TickOutcome::Ran(report) => report,
        TickOutcome::NotLeader => panic!("expected to hold the lease"),
    }
}

struct CountingSweep {
    name: &'static str,
    runs: AtomicUsize,
    failures_left: AtomicUsize,
}

impl CountingSweep {
    fn new(name: &'static str) -> Arc<Self> {
        Self::failing_times(name, 0)
    }

    fn failing(name: &'static str) -> Arc<Self> {
        Self::failing_times(name, usize::MAX)
    }

    fn failing_times(name: &'static str, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            name,
            runs: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(failures),
        })
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MaintenanceSweep for CountingSweep {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, _now: DateTime<Utc>) -> Result<usize, CoordinatorError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(CoordinatorError::Sweep {
                name: self.name.to_string(),
                message: "broken".to_string(),
            });
        }
        Ok(1)
    }
}

/// Panics on every run.
struct PanickingSweep {
    runs: AtomicUsize,
}

#[async_trait]
impl MaintenanceSweep for PanickingSweep {
    fn name(&self) -> &str {
        "exploding"
    }

    async fn run(&self, _now: DateTime<Utc>) -> Result<usize, CoordinatorError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        panic!("sweep blew up");
    }
}

// ── Tick ─────────────────────────────────────────────────────

#[tokio::test]
async fn jobs_queued_by_escalation_run_in_the_same_tick() {
    let h = harness();
    h.dispatcher.fail_channel(Channel::Sms);
    h.policy(vec![step(0, Uuid::new_v4(), vec![Channel::Sms])]);
    h.escalating(0, morning() - Duration::minutes(1));

    let report = ran(h.coordinator("worker-a").run_tick().await.unwrap());
    assert_eq!(report.escalations.escalated, 1);
    assert_eq!(report.jobs.claimed, 1);
    assert_eq!(report.jobs.retried, 1);
    assert!(report.succeeded());
}

#[tokio::test]
async fn delayed_step_fires_once_across_sweep_and_continuation_job() {
    let h = harness();
    let user = Uuid::new_v4();
    h.policy(vec![step(5, user, vec![])]);
    let id = h.incident();
    h.engine.execute(id, None).await.unwrap();

    h.clock.advance(Duration::minutes(5));
    let report = ran(h.coordinator("worker-a").run_tick().await.unwrap());

    assert_eq!(report.escalations.escalated, 1);
    assert_eq!(report.jobs.claimed, 1);
    assert_eq!(report.jobs.completed, 1);
    assert_eq!(h.dispatcher.sent_to(user).len(), 1);
    assert_eq!(h.store.incident(id).unwrap().escalation, EscalationState::Completed);
}

#[tokio::test]
async fn lease_held_elsewhere_blocks_until_stale() {
    let h = harness();
    h.policy(vec![step(0, Uuid::new_v4(), vec![])]);
    h.escalating(0, morning() - Duration::minutes(1));
    let now = h.clock.now();
    assert!(h.store.acquire_lease("worker-b", now, now - Duration::minutes(2)).await.unwrap());

    let coordinator = h.coordinator("worker-a");
    assert!(matches!(coordinator.run_tick().await.unwrap(), TickOutcome::NotLeader));
    assert!(h.dispatcher.sent().is_empty());

    h.clock.advance(Duration::minutes(3));
    let report = ran(coordinator.run_tick().await.unwrap());
    assert_eq!(report.escalations.escalated, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_workers_notify_each_incident_once() {
    let h = harness();
    h.policy(vec![step(0, Uuid::new_v4(), vec![])]);
    for _ in 0..10 {
        h.escalating(0, morning() - Duration::minutes(1));
    }

    let mut handles = Vec::new();
    for n in 0..5 {
        let coordinator = Arc::new(h.coordinator(&format!("worker-{n}")));
        handles.push(tokio::spawn(async move { coordinator.run_tick().await.unwrap() }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(h.dispatcher.sent().len(), 10);
}

#[tokio::test]
async fn status_reflects_the_last_tick() {
    let h = harness();
    let coordinator = h.coordinator("worker-a");
    ran(coordinator.run_tick().await.unwrap());

    let status = coordinator.status().await.unwrap();
    assert_eq!(status.holder, None);
    assert_eq!(status.last_run_at, Some(morning()));
    assert_eq!(status.last_success_at, Some(morning()));
    assert_eq!(status.last_error, None);
    assert_eq!(status.next_run_at, Some(morning() + Duration::seconds(60)));
}

#[tokio::test]
async fn failing_sweep_is_recorded_and_later_sweeps_still_run() {
    let h = harness();
    let broken = CountingSweep::failing("sla_breach_check");
    let after = CountingSweep::new("token_cleanup");
    let mut coordinator = h.coordinator("worker-a");
    coordinator.register_sweep(broken.clone());
    coordinator.register_sweep(after.clone());

    let report = ran(coordinator.run_tick().await.unwrap());
    assert_eq!(report.errors.len(), 1);
    assert_eq!(after.runs(), 1);
    assert_eq!(report.sweeps.len(), 1);
    assert_eq!(report.sweeps[0].name, "token_cleanup");

    let status = coordinator.status().await.unwrap();
    assert_eq!(status.holder, None);
    assert_eq!(status.last_success_at, None);
    assert!(status.last_error.unwrap().contains("broken"));
}

// ── Daily tasks ──────────────────────────────────────────────

#[tokio::test]
async fn daily_tasks_run_once_per_day_after_the_hour() {
    let h = harness();
    let daily = CountingSweep::new("rollups");
    let mut coordinator = h.coordinator("worker-a");
    coordinator.register_daily(daily.clone());

    h.clock.set(morning() - Duration::hours(2));
    ran(coordinator.run_tick().await.unwrap());
    assert_eq!(daily.runs(), 0);

    h.clock.set(morning());
    ran(coordinator.run_tick().await.unwrap());
    ran(coordinator.run_tick().await.unwrap());
    assert_eq!(daily.runs(), 1);

    let mut other = h.coordinator("worker-b");
    let other_daily = CountingSweep::new("rollups");
    other.register_daily(other_daily.clone());
    ran(other.run_tick().await.unwrap());
    assert_eq!(other_daily.runs(), 0);

    h.clock.advance(Duration::days(1));
    ran(coordinator.run_tick().await.unwrap());
    assert_eq!(daily.runs(), 2);
}

#[tokio::test]
async fn failed_daily_task_runs_again_until_it_succeeds() {
    let h = harness();
    let flaky = CountingSweep::failing_times("rollups", 1);
    let steady = CountingSweep::new("token_cleanup");
    let mut coordinator = h.coordinator("worker-a");
    coordinator.register_daily(flaky.clone());
    coordinator.register_daily(steady.clone());

    let report = ran(coordinator.run_tick().await.unwrap());
    assert_eq!(report.errors.len(), 1);
    assert_eq!(steady.runs(), 1);
    assert_eq!(coordinator.status().await.unwrap().last_daily_run, None);

    let report = ran(coordinator.run_tick().await.unwrap());
    assert!(report.succeeded());
    assert_eq!(report.daily.len(), 2);
    assert_eq!(coordinator.status().await.unwrap().last_daily_run, Some(morning().date_naive()));

    ran(coordinator.run_tick().await.unwrap());
    assert_eq!((flaky.runs(), steady.runs()), (2, 2));
}

// ── Wake-up ──────────────────────────────────────────────────

#[tokio::test]
async fn idle_coordinator_sleeps_the_maximum() {
    let h = harness();
    let wake = h.coordinator("worker-a").compute_next_wake(h.clock.now()).await;
    assert_eq!(wake, StdDuration::from_secs(60));
}

#[tokio::test]
async fn wake_follows_the_nearest_escalation() {
    let h = harness();
    h.escalating(1, morning() + Duration::seconds(5));
    h.escalating(1, morning() + Duration::seconds(40));

    let wake = h.coordinator("worker-a").compute_next_wake(morning()).await;
    assert_eq!(wake, StdDuration::from_secs(5));
}

#[tokio::test]
async fn overdue_work_is_clamped_to_the_minimum() {
    let h = harness();
    h.escalating(0, morning() - Duration::minutes(10));

    let wake = h.coordinator("worker-a").compute_next_wake(morning()).await;
    assert_eq!(wake, StdDuration::from_secs(1));
}

#[tokio::test]
async fn far_future_work_is_clamped_to_the_maximum() {
    let h = harness();
    h.escalating(0, morning() + Duration::hours(3));

    let wake = h.coordinator("worker-a").compute_next_wake(morning()).await;
    assert_eq!(wake, StdDuration::from_secs(60));
}

#[tokio::test]
async fn sweep_hints_contribute_to_wake() {
    let h = harness();
    let id = h.incident();
    h.store.update_incident(id, |i| {
        i.status = IncidentStatus::Snoozed;
        i.snoozed_until = Some(morning() + Duration::seconds(10));
    });
    let mut coordinator = h.coordinator("worker-a");
    coordinator.register_sweep(Arc::new(UnsnoozeSweep::new(h.store.clone())));

    assert_eq!(coordinator.compute_next_wake(morning()).await, StdDuration::from_secs(10));
}

#[tokio::test]
async fn failed_lookup_falls_back_to_the_maximum() {
    let h = harness();
    h.escalating(0, morning() + Duration::seconds(5));
    h.store.fail_next("next_escalation_due", StoreError::Connection("reset".to_string()));

    let wake = h.coordinator("worker-a").compute_next_wake(morning()).await;
    assert_eq!(wake, StdDuration::from_secs(60));
}

// ── Lifecycle ────────────────────────────────────────────────

#[tokio::test]
async fn start_ticks_and_stop_ends_the_loop() {
    let h = harness();
    let coordinator = Arc::new(h.coordinator("worker-a"));
    coordinator.start();
    assert!(coordinator.is_running());

    let mut ticked = false;
    for _ in 0..200 {
        if coordinator.status().await.unwrap().last_run_at.is_some() {
            ticked = true;
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert!(ticked);

    coordinator.stop().await;
    assert!(!coordinator.is_running());
}

#[tokio::test]
async fn panicking_sweep_releases_the_lease_and_the_loop_keeps_ticking() {
    let h = harness();
    let mut config = scheduler_config("worker-a");
    config.lease_retry_ms = 10;
    let mut coordinator = Coordinator::new(
        CoordinatorDeps {
            engine: h.engine.clone(),
            jobs: h.jobs.clone(),
            lease: h.store.clone(),
            clock: h.clock.clone(),
        },
        config,
    );
    let sweep = Arc::new(PanickingSweep { runs: AtomicUsize::new(0) });
    coordinator.register_sweep(sweep.clone());
    let coordinator = Arc::new(coordinator);
    coordinator.start();

    let mut released = false;
    for _ in 0..200 {
        let status = coordinator.status().await.unwrap();
        if status.holder.is_none() && status.last_error.is_some_and(|e| e.contains("tick aborted")) {
            released = true;
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
    assert!(released);

    for _ in 0..200 {
        if sweep.runs.load(Ordering::SeqCst) >= 2 {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
    assert!(sweep.runs.load(Ordering::SeqCst) >= 2);
    assert!(coordinator.is_running());

    coordinator.stop().await;
    assert!(!coordinator.is_running());
}

#[tokio::test]
async fn disabled_coordinator_does_not_start() {
    let h = harness();
    let mut config = scheduler_config("worker-a");
    config.disabled = true;
    let coordinator = Arc::new(Coordinator::new(
        CoordinatorDeps {
            engine: h.engine.clone(),
            jobs: h.jobs.clone(),
            lease: h.store.clone(),
            clock: h.clock.clone(),
        },
        config,
    ));

    coordinator.start();
    assert!(!coordinator.is_running());
    coordinator.stop().await;
}
