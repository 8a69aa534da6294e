//! Escalation engine.
//!
//! Walks an incident through its escalation policy one step at a time.
//! Each step is claimed with a conditional update on the incident row, so
//! any number of workers may call [`EscalationEngine::execute`] for the
//! same incident and at most one of them notifies anyone.

pub mod engine;
pub mod error;
pub mod handler;
pub mod targets;

pub use engine::{EngineDeps, EscalationEngine, EscalationOutcome, EscalationSweepReport};
pub use error::EscalationError;
pub use handler::EscalationStepHandler;
pub use targets::{resolve_target, Target};
