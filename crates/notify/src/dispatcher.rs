//! Routes notifications to per-channel transports.
//!
//! Each `Channel` maps to one notifier. A channel without a route falls
//! back to the default notifier if one is set, otherwise the delivery is
//! reported as failed. One failed delivery never affects another.

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use oncall_core::Channel;

use crate::traits::{DeliveryReport, Notification, NotificationDispatcher, Notifier};

pub struct Dispatcher {
    routes: HashMap<Channel, Box<dyn Notifier>>,
    fallback: Option<Box<dyn Notifier>>,
}

impl Dispatcher {
    /// Create a dispatcher with no routes.
    pub fn empty() -> Self {
        Self {
            routes: HashMap::new(),
            fallback: None,
        }
    }

    /// Create a dispatcher that sends every channel through `notifier`.
    pub fn with_default(notifier: Box<dyn Notifier>) -> Self {
        Self {
            routes: HashMap::new(),
            fallback: Some(notifier),
        }
    }

    /// Route `channel` to `notifier`, replacing any existing route.
    pub fn route(&mut self, channel: Channel, notifier: Box<dyn Notifier>) {
        self.routes.insert(channel, notifier);
    }

    pub fn is_routed(&self, channel: Channel) -> bool {
        self.routes.contains_key(&channel) || self.fallback.is_some()
    }

    /// Deliver one notification and report the outcome.
    pub async fn dispatch(&self, notification: &Notification) -> DeliveryReport {
        let Some(notifier) = self.routes.get(&notification.channel).or(self.fallback.as_ref()) else {
            tracing::warn!(
                incident_id = %notification.incident_id,
                channel = %notification.channel,
                "No notifier configured for channel"
            );
            return DeliveryReport::failed(format!("no notifier for channel {}", notification.channel));
        };

        let start = std::time::Instant::now();
        let result = notifier.send(notification).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                tracing::info!(
                    incident_id = %notification.incident_id,
                    user_id = %notification.user_id,
                    channel = %notification.channel,
                    transport = notifier.channel_name(),
                    duration_ms,
                    "Notification delivered"
                );
                DeliveryReport::delivered()
            }
            Err(e) => {
                tracing::warn!(
                    incident_id = %notification.incident_id,
                    user_id = %notification.user_id,
                    channel = %notification.channel,
                    transport = notifier.channel_name(),
                    error = %e,
                    duration_ms,
                    "Notification delivery failed"
                );
                DeliveryReport::failed(e.to_string())
            }
        }
    }
}

#[async_trait]
impl NotificationDispatcher for Dispatcher {
    async fn send(&self, incident_id: Uuid, user_id: Uuid, channel: Channel, message: &str) -> DeliveryReport {
        let notification = Notification {
            incident_id,
            user_id,
            channel,
            message: message.to_string(),
        };
        self.dispatch(&notification).await
    }
}
