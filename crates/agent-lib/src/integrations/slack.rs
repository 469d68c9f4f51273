//! Slack incoming-webhook notifier

use super::{ChannelError, Notifier};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<&'a str>,
}

/// Posts plain-text messages to a Slack incoming webhook
pub struct SlackNotifier {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl SlackNotifier {
    /// An empty URL yields a notifier that silently drops messages
    pub fn new(webhook_url: impl Into<String>) -> Self {
        let webhook_url = Some(webhook_url.into()).filter(|u| !u.is_empty());
        if webhook_url.is_none() {
            debug!("Slack notifications disabled (SLACK_WEBHOOK_URL not set)");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            webhook_url,
            client,
        }
    }

    pub fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn post(&self, text: &str, channel: Option<&str>) -> Result<(), ChannelError> {
        let Some(url) = &self.webhook_url else {
            return Ok(());
        };

        let payload = WebhookPayload {
            text,
            channel: channel.filter(|c| !c.is_empty()),
        };
        let response = self.client.post(url).json(&payload).send().await?;

        if response.status().is_success() {
            debug!(channel = ?payload.channel, "Slack notification sent");
            Ok(())
        } else {
            let err = ChannelError::from_response("slack", response).await;
            warn!(error = %err, "Slack webhook request failed");
            Err(err)
        }
    }
}
