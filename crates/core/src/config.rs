use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::models::Channel;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key).as_deref() {
        Some("1") | Some("true") | Some("TRUE") | Some("yes") => true,
        Some("0") | Some("false") | Some("FALSE") | Some("no") => false,
        _ => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub postgres: PostgresConfig,
    pub engine: EngineConfig,
    pub scheduler: SchedulerConfig,
    pub jobs: JobsConfig,
    pub notify: NotifyConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `ONCALL_PROFILE`. When set (e.g. `PROD`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("ONCALL_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            postgres: PostgresConfig::from_env_profiled(p),
            engine: EngineConfig::from_env_profiled(p),
            scheduler: SchedulerConfig::from_env_profiled(p),
            jobs: JobsConfig::from_env_profiled(p),
            notify: NotifyConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject combinations that would make the coordinator misbehave.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.scheduler.min_delay_ms > self.scheduler.max_delay_ms {
            return Err(CoreError::InvalidConfig(format!(
                "SCHEDULER_MIN_DELAY_MS ({}) exceeds SCHEDULER_MAX_DELAY_MS ({})",
                self.scheduler.min_delay_ms, self.scheduler.max_delay_ms
            )));
        }
        if self.engine.batch_size == 0 || self.jobs.batch_size == 0 {
            return Err(CoreError::InvalidConfig("batch sizes must be positive".to_string()));
        }
        if self.scheduler.daily_hour > 23 {
            return Err(CoreError::InvalidConfig(format!(
                "SCHEDULER_DAILY_HOUR must be 0-23, got {}",
                self.scheduler.daily_hour
            )));
        }
        if self.jobs.max_attempts == 0 {
            return Err(CoreError::InvalidConfig("JOB_MAX_ATTEMPTS must be positive".to_string()));
        }
        Ok(())
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  postgres:    host={}, db={}", self.postgres.host, self.postgres.database);
        tracing::info!(
            "  engine:      tx_retries={}, lock_timeout={}s, batch={}",
            self.engine.max_tx_retries, self.engine.lock_timeout_secs, self.engine.batch_size
        );
        tracing::info!(
            "  scheduler:   disabled={}, delay={}..{}ms, lease_timeout={}s, worker={}",
            self.scheduler.disabled,
            self.scheduler.min_delay_ms,
            self.scheduler.max_delay_ms,
            self.scheduler.lease_timeout_secs,
            self.scheduler.worker_id
        );
        tracing::info!(
            "  jobs:        batch={}, max_attempts={}, backoff={}..{}s, retention={}d, stale_after={}s",
            self.jobs.batch_size,
            self.jobs.max_attempts,
            self.jobs.backoff_base_secs,
            self.jobs.backoff_max_secs,
            self.jobs.retention_days,
            self.jobs.processing_timeout_secs
        );
        tracing::info!(
            "  notify:      webhook={}, default_channel={}",
            if self.notify.webhook_url.is_some() { "configured" } else { "(none)" },
            self.notify.default_channel
        );
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "oncall".to_string(),
            username: None,
            password: None,
            ssl_mode: "prefer".to_string(),
            max_connections: 10,
        }
    }
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            host: profiled_env_or(p, "PG_HOST", &d.host),
            port: profiled_env_parse(p, "PG_PORT", d.port),
            database: profiled_env_or(p, "PG_DATABASE", &d.database),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", &d.ssl_mode),
            max_connections: profiled_env_parse(p, "PG_MAX_CONNECTIONS", d.max_connections),
        }
    }

    pub fn database_url(&self) -> String {
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub fn is_configured(&self) -> bool {
        self.username.is_some()
    }
}

// ── Escalation engine ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Immediate retries for transient store errors at the call site.
    pub max_tx_retries: u32,
    /// A processing lock older than this is considered abandoned.
    pub lock_timeout_secs: u64,
    /// Incidents examined per escalation sweep.
    pub batch_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_tx_retries: 3,
            lock_timeout_secs: 300,
            batch_size: 50,
        }
    }
}

impl EngineConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            max_tx_retries: profiled_env_parse(p, "TX_MAX_RETRIES", d.max_tx_retries),
            lock_timeout_secs: profiled_env_parse(p, "ESCALATION_LOCK_TIMEOUT_SECS", d.lock_timeout_secs),
            batch_size: profiled_env_parse(p, "ESCALATION_BATCH_SIZE", d.batch_size),
        }
    }

    pub fn lock_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lock_timeout_secs as i64)
    }
}

// ── Leader coordinator ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Kill-switch for deployments that drive ticks from an external cron.
    pub disabled: bool,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// A lease not renewed within this window may be taken over.
    pub lease_timeout_secs: u64,
    /// Retry delay after losing the lease race.
    pub lease_retry_ms: u64,
    /// UTC hour after which the daily tasks may run.
    pub daily_hour: u32,
    /// Lease holder identity of this process.
    pub worker_id: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            min_delay_ms: 1_000,
            max_delay_ms: 60_000,
            lease_timeout_secs: 120,
            lease_retry_ms: 5_000,
            daily_hour: 3,
            worker_id: generated_worker_id(),
        }
    }
}

fn generated_worker_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..8])
}

impl SchedulerConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            disabled: profiled_env_bool(p, "SCHEDULER_DISABLED", d.disabled),
            min_delay_ms: profiled_env_parse(p, "SCHEDULER_MIN_DELAY_MS", d.min_delay_ms),
            max_delay_ms: profiled_env_parse(p, "SCHEDULER_MAX_DELAY_MS", d.max_delay_ms),
            lease_timeout_secs: profiled_env_parse(p, "SCHEDULER_LEASE_TIMEOUT_SECS", d.lease_timeout_secs),
            lease_retry_ms: profiled_env_parse(p, "SCHEDULER_LEASE_RETRY_MS", d.lease_retry_ms),
            daily_hour: profiled_env_parse(p, "SCHEDULER_DAILY_HOUR", d.daily_hour),
            worker_id: profiled_env_opt(p, "WORKER_ID").unwrap_or(d.worker_id),
        }
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn lease_retry(&self) -> Duration {
        Duration::from_millis(self.lease_retry_ms)
    }

    pub fn lease_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_timeout_secs as i64)
    }
}

// ── Job store ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    pub batch_size: u32,
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// Terminal jobs older than this are purged by the daily cleanup.
    pub retention_days: u32,
    /// A job left in processing this long is treated as abandoned by its
    /// worker and requeued.
    pub processing_timeout_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            max_attempts: 3,
            backoff_base_secs: 30,
            backoff_max_secs: 3_600,
            retention_days: 7,
            processing_timeout_secs: 600,
        }
    }
}

impl JobsConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            batch_size: profiled_env_parse(p, "JOB_BATCH_SIZE", d.batch_size),
            max_attempts: profiled_env_parse(p, "JOB_MAX_ATTEMPTS", d.max_attempts),
            backoff_base_secs: profiled_env_parse(p, "JOB_BACKOFF_BASE_SECS", d.backoff_base_secs),
            backoff_max_secs: profiled_env_parse(p, "JOB_BACKOFF_MAX_SECS", d.backoff_max_secs),
            retention_days: profiled_env_parse(p, "JOB_RETENTION_DAYS", d.retention_days),
            processing_timeout_secs: profiled_env_parse(p, "JOB_PROCESSING_TIMEOUT_SECS", d.processing_timeout_secs),
        }
    }

    pub fn processing_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.processing_timeout_secs as i64)
    }
}

// ── Notifications ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    /// Used for users without a stored channel preference.
    pub default_channel: Channel,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            default_channel: Channel::Email,
        }
    }
}

impl NotifyConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            webhook_url: profiled_env_opt(p, "NOTIFY_WEBHOOK_URL"),
            default_channel: profiled_env_opt(p, "NOTIFY_DEFAULT_CHANNEL")
                .and_then(|c| c.parse().ok())
                .unwrap_or(d.default_channel),
        }
    }
}
