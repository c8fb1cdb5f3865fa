//! Channel that only logs. Used when notifications are disabled.

use async_trait::async_trait;
use tracing::info;

use crate::alert::WebhookMessage;
use crate::error::ChannelError;
use crate::NotifyChannel;

pub struct LogChannel;

#[async_trait]
impl NotifyChannel for LogChannel {
    fn name(&self) -> &'static str {
        "log"
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn send(&self, message: &WebhookMessage) -> Result<(), ChannelError> {
        info!(
            channel = "log",
            severity = %message.severity,
            title = %message.title,
            body = %message.body,
            "Notification (delivery disabled)"
        );
        Ok(())
    }
}
