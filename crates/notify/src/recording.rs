//! Dispatcher that keeps every send in memory instead of delivering it.
//! Used for dry runs and by tests across the workspace.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use oncall_core::Channel;

use crate::traits::{DeliveryReport, NotificationDispatcher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub incident_id: Uuid,
    pub user_id: Uuid,
    pub channel: Channel,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    sent: Mutex<Vec<SentMessage>>,
    failing: Mutex<HashSet<Channel>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report every later send on `channel` as failed.
    pub fn fail_channel(&self, channel: Channel) {
        self.failing.lock().unwrap_or_else(|e| e.into_inner()).insert(channel);
    }

    /// Successful sends, in order.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn sent_to(&self, user_id: Uuid) -> Vec<SentMessage> {
        self.sent().into_iter().filter(|m| m.user_id == user_id).collect()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn send(&self, incident_id: Uuid, user_id: Uuid, channel: Channel, message: &str) -> DeliveryReport {
        if self.failing.lock().unwrap_or_else(|e| e.into_inner()).contains(&channel) {
            return DeliveryReport::failed(format!("{channel} unavailable"));
        }
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push(SentMessage {
            incident_id,
            user_id,
            channel,
            message: message.to_string(),
        });
        DeliveryReport::delivered()
    }
}
