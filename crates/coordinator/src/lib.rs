//! Leader-elected scheduler for the escalation engine.
//!
//! Every worker process runs one [`Coordinator`]. A singleton lease in the
//! store decides which of them executes a tick; the others retry shortly.
//! A tick runs, in order: the escalation sweep, the job sweep, the
//! registered maintenance sweeps and, once per day, the daily tasks.
//! The coordinator then sleeps until the nearest pending work.

pub mod coordinator;
pub mod error;
pub mod sweeps;

pub use coordinator::{Coordinator, CoordinatorDeps, SweepRun, TickOutcome, TickReport};
pub use error::CoordinatorError;
pub use sweeps::{JobRetentionSweep, MaintenanceSweep, UnsnoozeSweep};
