//! JSON webhook channel (Slack-compatible incoming webhooks and similar).

use std::time::Duration;

use async_trait::async_trait;
use kalert_core::AlertPayload;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{Notifier, NotifyError};

/// Display name sent with each message unless disabled.
pub const DEFAULT_USERNAME: &str = "kube-event-alert";

#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
}

/// Posts `{"text": ..., "username": ...}` to a webhook URL. Only HTTP 200 counts
/// as delivered.
pub struct WebhookNotifier {
    webhook_url: String,
    username: Option<String>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    /// Webhook sink that identifies itself as [`DEFAULT_USERNAME`].
    #[must_use]
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            username: Some(DEFAULT_USERNAME.to_string()),
            client: reqwest::Client::new(),
        }
    }

    /// Plain Slack-style sink: text only, no display name.
    #[must_use]
    pub fn slack(webhook_url: impl Into<String>) -> Self {
        Self::new(webhook_url).with_username(None)
    }

    #[must_use]
    pub fn with_username(mut self, username: Option<String>) -> Self {
        self.username = username;
        self
    }

    /// Bound each delivery attempt by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, NotifyError> {
        self.client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    fn body<'a>(&'a self, payload: &AlertPayload) -> WebhookBody<'a> {
        WebhookBody { text: payload.summary(), username: self.username.as_deref() }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, payload: &AlertPayload) -> Result<(), NotifyError> {
        let body = self.body(payload);
        debug!(kind = %payload.kind, ns = %payload.namespace, name = %payload.name, "sending webhook notification");

        let resp = self.client.post(&self.webhook_url).json(&body).send().await?;
        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "webhook rejected notification");
            metrics::counter!("notifications_failed_total", 1u64);
            return Err(NotifyError::Status { status: status.as_u16(), body });
        }
        metrics::counter!("notifications_sent_total", 1u64);
        Ok(())
    }
}
