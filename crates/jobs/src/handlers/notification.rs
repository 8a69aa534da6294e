use std::sync::Arc;

use async_trait::async_trait;

use oncall_core::{BackgroundJob, JobType, NotificationPayload};
use oncall_notify::NotificationDispatcher;

use crate::error::JobError;
use crate::handler::{HandlerOutcome, JobHandler};

/// Delivers a queued notification. An undelivered message is a failed
/// attempt so the runner's backoff applies.
pub struct NotificationJobHandler {
    dispatcher: Arc<dyn NotificationDispatcher>,
}

impl NotificationJobHandler {
    pub fn new(dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl JobHandler for NotificationJobHandler {
    fn job_type(&self) -> JobType {
        JobType::Notification
    }

    async fn handle(&self, job: &BackgroundJob) -> Result<HandlerOutcome, JobError> {
        let payload: NotificationPayload = job.payload_as()?;
        let report = self
            .dispatcher
            .send(payload.incident_id, payload.user_id, payload.channel, &payload.message)
            .await;
        if report.success {
            Ok(HandlerOutcome::Done)
        } else {
            Ok(HandlerOutcome::Failed {
                error: report.error.unwrap_or_else(|| "delivery failed".to_string()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use oncall_core::{Channel, JobStatus};
    use oncall_notify::DeliveryReport;
    use std::sync::Mutex;
    use uuid::Uuid;

    struct Recording {
        sent: Mutex<Vec<(Uuid, Channel, String)>>,
        succeed: bool,
    }

    #[async_trait]
    impl NotificationDispatcher for Recording {
        async fn send(&self, _incident_id: Uuid, user_id: Uuid, channel: Channel, message: &str) -> DeliveryReport {
            self.sent.lock().unwrap().push((user_id, channel, message.to_string()));
            if self.succeed {
                DeliveryReport::delivered()
            } else {
                DeliveryReport::failed("gateway timeout")
            }
        }
    }

    fn job(payload: serde_json::Value) -> BackgroundJob {
        BackgroundJob {
            id: Uuid::new_v4(),
            job_type: JobType::Notification,
            status: JobStatus::Processing,
            run_at: Utc::now(),
            payload,
            attempts: 1,
            max_attempts: 3,
            last_error: None,
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
        }
    }

    fn payload(user: Uuid) -> serde_json::Value {
        serde_json::to_value(NotificationPayload {
            incident_id: Uuid::new_v4(),
            user_id: user,
            channel: Channel::Sms,
            message: "db down".to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn delivers_payload_through_dispatcher() {
        let dispatcher = Arc::new(Recording { sent: Mutex::new(vec![]), succeed: true });
        let handler = NotificationJobHandler::new(dispatcher.clone());
        let user = Uuid::new_v4();

        let outcome = handler.handle(&job(payload(user))).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Done);
        assert_eq!(dispatcher.sent.lock().unwrap()[0], (user, Channel::Sms, "db down".to_string()));
    }

    #[tokio::test]
    async fn undelivered_message_is_a_failure() {
        let dispatcher = Arc::new(Recording { sent: Mutex::new(vec![]), succeed: false });
        let handler = NotificationJobHandler::new(dispatcher);
        let outcome = handler.handle(&job(payload(Uuid::new_v4()))).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Failed { error: "gateway timeout".to_string() });
    }

    #[tokio::test]
    async fn malformed_payload_is_an_error() {
        let dispatcher = Arc::new(Recording { sent: Mutex::new(vec![]), succeed: true });
        let handler = NotificationJobHandler::new(dispatcher);
        let result = handler.handle(&job(serde_json::json!({ "userId": 5 }))).await;
        assert!(matches!(result, Err(JobError::Payload(_))));
    }
}
