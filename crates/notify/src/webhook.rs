//! HTTP webhook notifier.
//!
//! Posts each notification as JSON to one endpoint. `${VAR}` references
//! in the URL and header values are expanded from the environment when
//! the notifier is built, so secrets stay out of config files.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::traits::{Notification, Notifier, NotifyError};

#[derive(Debug)]
pub struct WebhookNotifier {
    url: String,
    method: reqwest::Method,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

/// Wire shape of a webhook delivery.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookBody<'a> {
    incident_id: Uuid,
    user_id: Uuid,
    channel: &'a str,
    message: &'a str,
}

impl WebhookNotifier {
    /// Build a notifier for `url`. `method` defaults to `POST`.
    pub fn new(
        url: &str,
        method: Option<&str>,
        headers: HashMap<String, String>,
    ) -> Result<Self, NotifyError> {
        let method = match method {
            Some(m) => m
                .to_uppercase()
                .parse::<reqwest::Method>()
                .map_err(|_| NotifyError::Config(format!("invalid HTTP method: {m}")))?,
            None => reqwest::Method::POST,
        };

        let resolved_headers = headers
            .iter()
            .map(|(k, v)| Ok((k.clone(), expand_env(v)?)))
            .collect::<Result<HashMap<_, _>, NotifyError>>()?;

        Ok(Self {
            url: expand_env(url)?,
            method,
            headers: resolved_headers,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let body = WebhookBody {
            incident_id: notification.incident_id,
            user_id: notification.user_id,
            channel: notification.channel.as_str(),
            message: &notification.message,
        };

        let mut request = self.client.request(self.method.clone(), &self.url).json(&body);
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            tracing::warn!(url = %self.url, %status, body = %text, "webhook returned non-2xx status");
            return Err(NotifyError::Rejected(format!("webhook returned {status}: {text}")));
        }

        tracing::debug!(url = %self.url, method = %self.method, %status, "webhook notification delivered");
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "webhook"
    }
}

/// Expand `${NAME}` references from the process environment.
fn expand_env(input: &str) -> Result<String, NotifyError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find('}')
            .ok_or_else(|| NotifyError::Config(format!("unclosed env var reference in: {input}")))?;
        let name = &after[..close];
        let value = std::env::var(name).map_err(|_| NotifyError::Config(format!("env var not found: {name}")))?;
        out.push_str(&value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
