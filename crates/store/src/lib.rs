//! Persistent store boundary for the escalation engine.
//!
//! All cross-process coordination is expressed as conditional or atomic
//! updates behind the traits in [`traits`]: per-incident step claims,
//! per-job claims and the scheduler lease. Two backends implement them:
//! - [`PgStore`]: PostgreSQL via sqlx, `FOR UPDATE SKIP LOCKED` claims
//! - [`MemoryStore`]: in-process, every operation atomic under one mutex

pub mod error;
pub mod memory;
pub mod pg;
pub mod retry;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use pg::PgStore;
pub use retry::with_retries;
pub use traits::{Directory, EscalationAdvance, IncidentStore, JobStore, LeaseRelease, LeaseStore, STALE_ERROR};
