//! Notifier that only writes a log line.

use async_trait::async_trait;

use crate::traits::{Notification, Notifier, NotifyError};

/// Logs deliveries instead of sending them. Default transport for
/// channels without a real integration in development.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            incident_id = %notification.incident_id,
            user_id = %notification.user_id,
            channel = %notification.channel,
            message = %notification.message,
            "notification (log transport)"
        );
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "log"
    }
}
