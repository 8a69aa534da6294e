//! Notification delivery for escalation steps.
//!
//! This crate provides:
//! - `NotificationDispatcher`, the boundary the escalation engine calls
//! - `Notifier` trait for pluggable per-channel transports
//! - Webhook and log notifier implementations, and an in-memory
//!   recording dispatcher for dry runs
//! - `Dispatcher` routing each channel to its notifier
//! - Minijinja rendering of escalation messages

pub mod dispatcher;
pub mod log;
pub mod recording;
pub mod templating;
pub mod traits;
pub mod webhook;

pub use dispatcher::Dispatcher;
pub use log::LogNotifier;
pub use recording::RecordingDispatcher;
pub use templating::MessageRenderer;
pub use traits::{DeliveryReport, Notification, NotificationDispatcher, Notifier, NotifyError};
pub use webhook::WebhookNotifier;
