//! Alert delivery for pubwatch.
//!
//! This crate turns [`AlertRecord`]s into a generic webhook message and
//! delivers them in the background with exponential backoff.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use notify::{AlertKind, AlertRecord, Dispatcher, RetryPolicy, Severity, WebhookChannel};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), notify::ChannelError> {
//! let channel = WebhookChannel::new(
//!     Some("https://hooks.example.com/abc".to_string()),
//!     "pubwatch",
//!     Duration::from_secs(10),
//! )?;
//! let worker = Dispatcher::new(Arc::new(channel), RetryPolicy::default())
//!     .spawn(CancellationToken::new(), Duration::from_secs(5));
//!
//! worker.handle.enqueue(AlertRecord::new(
//!     "kospi-close",
//!     Severity::Warning,
//!     AlertKind::Escalation,
//!     "KOSPI close delayed",
//!     "published 25 minutes after the window closed",
//!     chrono::Utc::now(),
//! ));
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`NotifyChannel`] trait defines the interface for notification channels
//! - [`WebhookChannel`] posts the generic `botName`/`text`/`attachments` payload
//! - [`LogChannel`] only logs, for when delivery is disabled
//! - [`Dispatcher`] owns the retry queue on a background task

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod alert;
pub mod channels;
pub mod dispatch;
pub mod error;

pub use alert::{hex_color, AlertKind, AlertRecord, DispatchStatus, Severity, WebhookMessage};
pub use channels::log::LogChannel;
pub use channels::webhook::WebhookChannel;
pub use channels::NotifyChannel;
pub use dispatch::{DispatchHandle, DispatchResult, DispatchWorker, Dispatcher, RetryPolicy};
pub use error::ChannelError;

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Environment variable to disable all notifications.
pub const ENV_NOTIFY_DISABLED: &str = "NOTIFY_DISABLED";

/// Pick the channel for a webhook URL: the webhook when configured and not
/// disabled, otherwise the logging channel.
pub fn channel_for(
    webhook_url: Option<String>,
    bot_name: &str,
    timeout: Duration,
    disabled: bool,
) -> Result<Arc<dyn NotifyChannel>, ChannelError> {
    if disabled {
        info!("Notifications disabled, alerts will only be logged");
        return Ok(Arc::new(LogChannel));
    }

    let webhook = WebhookChannel::new(webhook_url, bot_name, timeout)?;
    if webhook.enabled() {
        info!("Webhook notifications enabled");
        Ok(Arc::new(webhook))
    } else {
        info!("No webhook configured, alerts will only be logged");
        Ok(Arc::new(LogChannel))
    }
}

/// Whether `NOTIFY_DISABLED` is set to a truthy value.
#[must_use]
pub fn disabled_from_env() -> bool {
    std::env::var(ENV_NOTIFY_DISABLED)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}
