//! Persisted background jobs.
//!
//! [`JobRunner`] claims due jobs from a [`oncall_store::JobStore`], hands
//! each to the [`JobHandler`] registered for its type and records the
//! outcome, applying exponential backoff to failures. Handlers for
//! notification delivery and auto-unsnooze live in [`handlers`]; the
//! escalation continuation handler lives in `oncall-escalation`.

pub mod backoff;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod runner;

pub use error::JobError;
pub use handler::{HandlerOutcome, JobHandler};
pub use handlers::{NotificationJobHandler, UnsnoozeJobHandler};
pub use runner::{FailureDisposition, JobRunner, JobSweepReport};
