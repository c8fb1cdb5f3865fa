//! Alert records and the transport-agnostic message they format into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Alert tier.
///
/// Ordered so that `Info < Warning < Critical`; escalation compares tiers
/// with the ordinary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - slightly late, recovered, summaries
    Info,
    /// Warning - something needs attention
    Warning,
    /// Critical - immediate action required
    Critical,
}

impl Severity {
    /// Get the color for this severity as a `0xRRGGBB` value.
    #[must_use]
    pub const fn color(&self) -> u32 {
        match self {
            Self::Info => 0x0034_98db,     // Blue
            Self::Warning => 0x00f3_9c12,  // Orange
            Self::Critical => 0x00e7_4c3c, // Red
        }
    }

    /// Get display name for this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
            Self::Critical => "Critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Color used for recovery notices regardless of tier.
const RECOVERY_COLOR: u32 = 0x0028_a745;

/// Format a `0xRRGGBB` value as `#rrggbb`.
#[must_use]
pub fn hex_color(color: u32) -> String {
    format!("#{:06x}", color & 0x00ff_ffff)
}

/// Why an alert was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Tier went up for a feed
    Escalation,
    /// Feed published after having alerted today
    Recovery,
    /// Alerts held back during quiet hours, sent as one
    QuietHoursSummary,
    /// End-of-day digest of every feed
    DailySummary,
    /// Raised by the process itself (persistence, supervision)
    System,
}

/// Delivery status of an [`AlertRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Pending,
    Sent,
    Failed,
}

/// One alert on its way to the webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: String,
    pub feed_id: String,
    pub tier: Severity,
    pub kind: AlertKind,
    pub title: String,
    pub body: String,
    pub status: DispatchStatus,
    pub attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl AlertRecord {
    /// Create a pending record with a fresh id.
    pub fn new(
        feed_id: impl Into<String>,
        tier: Severity,
        kind: AlertKind,
        title: impl Into<String>,
        body: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            feed_id: feed_id.into(),
            tier,
            kind,
            title: title.into(),
            body: body.into(),
            status: DispatchStatus::Pending,
            attempts: 0,
            next_retry_at: None,
            created_at,
            last_error: None,
        }
    }

    /// Format this record for a channel.
    #[must_use]
    pub fn to_message(&self) -> WebhookMessage {
        let color = if self.kind == AlertKind::Recovery {
            RECOVERY_COLOR
        } else {
            self.tier.color()
        };

        WebhookMessage {
            severity: self.tier,
            title: self.title.clone(),
            body: self.body.clone(),
            color: hex_color(color),
        }
    }
}

/// Transport-agnostic message: what every channel knows how to send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookMessage {
    pub severity: Severity,
    pub title: String,
    pub body: String,
    /// `#RRGGBB`
    pub color: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_order() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Critical);
        assert_eq!(
            [Severity::Warning, Severity::Critical, Severity::Info]
                .into_iter()
                .max(),
            Some(Severity::Critical)
        );
    }

    #[test]
    fn test_hex_color() {
        assert_eq!(hex_color(Severity::Info.color()), "#3498db");
        assert_eq!(hex_color(Severity::Warning.color()), "#f39c12");
        assert_eq!(hex_color(Severity::Critical.color()), "#e74c3c");
    }

    #[test]
    fn test_recovery_message_is_green() {
        let record = AlertRecord::new(
            "kospi-close",
            Severity::Info,
            AlertKind::Recovery,
            "KOSPI close published",
            "published 16:05",
            Utc::now(),
        );
        let message = record.to_message();
        assert_eq!(message.color, "#28a745");
        assert_eq!(message.severity, Severity::Info);
        assert_eq!(record.status, DispatchStatus::Pending);
        assert_eq!(record.attempts, 0);
    }
}
