//! Notification channel implementations.

pub mod log;
pub mod webhook;

use async_trait::async_trait;

use crate::alert::WebhookMessage;
use crate::error::ChannelError;

/// Trait for notification channels.
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    /// Get the name of this channel.
    fn name(&self) -> &'static str;

    /// Check if this channel is enabled/configured.
    fn enabled(&self) -> bool;

    /// Deliver one message. One attempt, no retries.
    async fn send(&self, message: &WebhookMessage) -> Result<(), ChannelError>;
}
