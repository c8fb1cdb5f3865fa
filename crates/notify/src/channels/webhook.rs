//! Generic JSON webhook channel.
//!
//! Posts `{"botName", "text", "attachments": [{"color", "text"}]}`, the
//! lowest common denominator that incoming-webhook style chat services accept.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::alert::WebhookMessage;
use crate::error::ChannelError;
use crate::NotifyChannel;

/// Webhook notification channel.
pub struct WebhookChannel {
    webhook_url: Option<String>,
    bot_name: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    /// Create a webhook channel. `None` for the URL yields a disabled channel.
    pub fn new(
        webhook_url: Option<String>,
        bot_name: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let webhook_url = webhook_url.filter(|u| !u.trim().is_empty());

        if webhook_url.is_some() {
            debug!("Webhook notifications enabled");
        } else {
            debug!("Webhook notifications disabled (no webhook URL)");
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            webhook_url,
            bot_name: bot_name.into(),
            client,
        })
    }

    /// Format a message as a webhook payload.
    fn format_payload(&self, message: &WebhookMessage) -> WebhookPayload {
        let text = if message.body.is_empty() {
            String::new()
        } else {
            format!("{}\n\n[{}]", message.body, message.severity.as_str())
        };

        WebhookPayload {
            bot_name: self.bot_name.clone(),
            text: message.title.clone(),
            attachments: vec![WebhookAttachment {
                color: message.color.clone(),
                text,
            }],
        }
    }
}

#[async_trait]
impl NotifyChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn send(&self, message: &WebhookMessage) -> Result<(), ChannelError> {
        let webhook_url = self
            .webhook_url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured("webhook url".to_string()))?;

        let payload = self.format_payload(message);

        debug!(channel = "webhook", title = %message.title, "Sending notification");

        let response = self.client.post(webhook_url).json(&payload).send().await?;
        let status = response.status();

        if status.is_success() {
            debug!(channel = "webhook", "Notification sent successfully");
            return Ok(());
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(30);
            return Err(ChannelError::RateLimited { retry_after_secs });
        }

        let body = response.text().await.unwrap_or_default();

        warn!(
            channel = "webhook",
            status = %status,
            body = %body,
            "Webhook request failed"
        );

        Err(ChannelError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

// =============================================================================
// Webhook wire types
// =============================================================================

#[derive(Debug, Serialize)]
struct WebhookPayload {
    #[serde(rename = "botName")]
    bot_name: String,
    text: String,
    attachments: Vec<WebhookAttachment>,
}

#[derive(Debug, Serialize)]
struct WebhookAttachment {
    color: String,
    text: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::Severity;

    fn message() -> WebhookMessage {
        WebhookMessage {
            severity: Severity::Warning,
            title: "KOSPI close delayed".to_string(),
            body: "25 minutes late".to_string(),
            color: "#f39c12".to_string(),
        }
    }

    #[test]
    fn test_payload_shape() {
        let channel =
            WebhookChannel::new(Some("http://x".into()), "pubwatch", Duration::from_secs(5))
                .unwrap();
        let payload = serde_json::to_value(channel.format_payload(&message())).unwrap();

        assert_eq!(payload["botName"], "pubwatch");
        assert_eq!(payload["text"], "KOSPI close delayed");
        assert_eq!(payload["attachments"][0]["color"], "#f39c12");
        assert_eq!(
            payload["attachments"][0]["text"],
            "25 minutes late\n\n[Warning]"
        );
    }

    #[test]
    fn test_blank_url_disables_channel() {
        let channel =
            WebhookChannel::new(Some("  ".into()), "pubwatch", Duration::from_secs(5)).unwrap();
        assert!(!channel.enabled());
    }

    #[tokio::test]
    async fn test_send_without_url_is_not_configured() {
        let channel = WebhookChannel::new(None, "pubwatch", Duration::from_secs(5)).unwrap();
        let err = channel.send(&message()).await.unwrap_err();
        assert!(matches!(err, ChannelError::NotConfigured(_)));
    }
}
