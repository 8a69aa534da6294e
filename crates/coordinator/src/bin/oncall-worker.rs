//! oncall-worker: runs the escalation engine against PostgreSQL.
//!
//! Any number of workers may run at once; the scheduler lease makes one of
//! them the active scheduler. With `--once` the worker runs a single tick
//! and exits, for deployments that drive ticks from an external cron.

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use oncall_coordinator::{Coordinator, CoordinatorDeps, JobRetentionSweep, TickOutcome, UnsnoozeSweep};
use oncall_core::{Channel, Clock, Config, SystemClock};
use oncall_escalation::{EngineDeps, EscalationEngine, EscalationStepHandler};
use oncall_jobs::{JobRunner, NotificationJobHandler, UnsnoozeJobHandler};
use oncall_notify::{Dispatcher, LogNotifier, MessageRenderer, NotificationDispatcher, WebhookNotifier};
use oncall_store::PgStore;

// ── CLI ─────────────────────────────────────────────────────────────

/// On-call escalation worker.
#[derive(Parser, Debug)]
#[command(name = "oncall-worker", version, about)]
struct Cli {
    /// Config profile; `{PROFILE}_KEY` env vars override `KEY`.
    #[arg(long, env = "ONCALL_PROFILE", default_value = "")]
    profile: String,

    /// Lease holder identity. Defaults to a random id per process.
    #[arg(long, env = "WORKER_ID")]
    worker_id: Option<String>,

    /// Run one tick and exit.
    #[arg(long)]
    once: bool,

    /// Skip running migrations at startup.
    #[arg(long, env = "SKIP_MIGRATIONS")]
    skip_migrations: bool,

    /// Message template for escalation notifications (minijinja syntax).
    #[arg(long, env = "NOTIFY_TEMPLATE")]
    template: Option<String>,
}

fn build_dispatcher(config: &Config) -> anyhow::Result<Dispatcher> {
    let mut dispatcher = Dispatcher::with_default(Box::new(LogNotifier));
    if let Some(url) = &config.notify.webhook_url {
        let webhook = WebhookNotifier::new(url, None, HashMap::new())?;
        dispatcher.route(Channel::Webhook, Box::new(webhook));
        info!("Webhook channel routed");
    }
    Ok(dispatcher)
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    oncall_core::config::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::for_profile(&cli.profile);
    if let Some(id) = cli.worker_id {
        config.scheduler.worker_id = id;
    }
    config.validate()?;
    config.log_summary();

    let store = Arc::new(PgStore::connect(&config.postgres).await?);
    if cli.skip_migrations {
        warn!("Skipping migrations");
    } else {
        store.migrate().await?;
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let dispatcher: Arc<dyn NotificationDispatcher> = Arc::new(build_dispatcher(&config)?);

    let renderer = match cli.template {
        Some(template) => MessageRenderer::new(template)?,
        None => MessageRenderer::default(),
    };
    let engine = Arc::new(
        EscalationEngine::new(
            EngineDeps {
                incidents: store.clone(),
                directory: store.clone(),
                jobs: store.clone(),
                dispatcher: dispatcher.clone(),
                clock: clock.clone(),
            },
            config.engine.clone(),
        )
        .with_default_channel(config.notify.default_channel)
        .with_job_max_attempts(config.jobs.max_attempts)
        .with_renderer(renderer),
    );

    let mut runner = JobRunner::new(store.clone(), clock.clone(), config.jobs.clone())
        .with_tx_retries(config.engine.max_tx_retries);
    runner.register(Arc::new(EscalationStepHandler::new(engine.clone())));
    runner.register(Arc::new(NotificationJobHandler::new(dispatcher.clone())));
    runner.register(Arc::new(UnsnoozeJobHandler::new(store.clone(), clock.clone())));
    let jobs = Arc::new(runner);

    let mut coordinator = Coordinator::new(
        CoordinatorDeps {
            engine,
            jobs: jobs.clone(),
            lease: store.clone(),
            clock,
        },
        config.scheduler.clone(),
    )
    .with_tx_retries(config.engine.max_tx_retries);
    coordinator.register_sweep(Arc::new(
        UnsnoozeSweep::new(store.clone()).with_tx_retries(config.engine.max_tx_retries),
    ));
    coordinator.register_daily(Arc::new(JobRetentionSweep::new(jobs)));
    let coordinator = Arc::new(coordinator);

    if cli.once {
        match coordinator.run_tick().await? {
            TickOutcome::NotLeader => info!("Another worker holds the lease, nothing to do"),
            TickOutcome::Ran(report) if !report.succeeded() => {
                anyhow::bail!("tick finished with errors: {}", report.errors.join("; "))
            }
            TickOutcome::Ran(_) => info!("Tick complete"),
        }
        return Ok(());
    }

    if config.scheduler.disabled {
        info!("Scheduler disabled; run with --once from cron to drive ticks");
        return Ok(());
    }

    coordinator.start();
    info!(worker_id = %coordinator.worker_id(), "oncall-worker running, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    coordinator.stop().await;

    info!("oncall-worker exited cleanly");
    Ok(())
}
