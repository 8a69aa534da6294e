//! Notifier traits and shared error types.

use async_trait::async_trait;
use uuid::Uuid;

use oncall_core::Channel;

/// Errors that can occur during notification delivery.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Template rendering failed: {0}")]
    Template(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Delivery rejected: {0}")]
    Rejected(String),
}

/// A rendered message addressed to one user on one channel.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Notification {
    pub incident_id: Uuid,
    pub user_id: Uuid,
    pub channel: Channel,
    pub message: String,
}

/// Per-channel transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a notification through this channel.
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;

    /// Human-readable name for this transport (e.g. "webhook", "log").
    fn channel_name(&self) -> &str;
}

/// Outcome of one delivery attempt. Failures are data, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub success: bool,
    pub error: Option<String>,
}

impl DeliveryReport {
    pub fn delivered() -> Self {
        Self { success: true, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// What the escalation engine and the notification job call.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(&self, incident_id: Uuid, user_id: Uuid, channel: Channel, message: &str) -> DeliveryReport;
}
