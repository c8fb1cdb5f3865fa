//! Alert escalation engine.
//!
//! Turns classified feed state into at most one [`AlertRecord`] per cycle.
//! Tiers only rise within a day; a feed that publishes after having alerted
//! gets one recovery notice, which resets its tier.

use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use notify::{AlertKind, AlertRecord, Severity};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{debug, info};

use crate::calendar::{hhmm, Calendar};
use crate::classifier::{Classification, PublicationState};
use crate::feed::FeedDefinition;

/// Feed id used for quiet-hours summaries.
pub const QUIET_HOURS_FEED: &str = "quiet-hours";

/// Daily window during which only CRITICAL alerts go out. May wrap midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,

    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl QuietHours {
    #[must_use]
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= time && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// Tier a classification warrants on its own, before any suppression.
#[must_use]
pub fn tier_for(
    feed: &FeedDefinition,
    classification: Classification,
    delay_minutes: Option<i64>,
) -> Option<Severity> {
    let thresholds = &feed.thresholds;
    match classification {
        Classification::Pending | Classification::OnTime => None,
        Classification::Delayed => {
            let delay = delay_minutes.unwrap_or(0);
            if delay < i64::from(thresholds.warning_after_mins) {
                Some(Severity::Info)
            } else if delay < i64::from(thresholds.critical_after_mins) {
                Some(Severity::Warning)
            } else {
                Some(Severity::Critical)
            }
        }
        Classification::Missing => Some(thresholds.missing_tier),
        Classification::Stale | Classification::Unknown => Some(Severity::Warning),
    }
}

#[derive(Debug, Clone)]
pub struct Escalator {
    cooldown: chrono::Duration,
    quiet_hours: Option<QuietHours>,
    offset: FixedOffset,
}

impl Escalator {
    #[must_use]
    pub fn new(cooldown: Duration, quiet_hours: Option<QuietHours>, calendar: &Calendar) -> Self {
        Self {
            cooldown: chrono::Duration::from_std(cooldown).unwrap_or_else(|_| chrono::Duration::days(365)),
            quiet_hours,
            offset: calendar.offset(),
        }
    }

    /// Quiet hours are read on the calendar's clock.
    #[must_use]
    pub fn in_quiet_hours(&self, now: DateTime<Utc>) -> bool {
        self.quiet_hours
            .as_ref()
            .is_some_and(|q| q.contains(now.with_timezone(&self.offset).time()))
    }

    /// Decide whether `state` warrants an alert now.
    ///
    /// Returns the record to dispatch immediately. INFO/WARNING records raised
    /// during quiet hours go to `quiet_queue` instead. Either way the tier
    /// bookkeeping in `state` moves on; the cooldown only starts for records
    /// that are dispatched.
    pub fn evaluate(
        &self,
        feed: &FeedDefinition,
        state: &mut PublicationState,
        content_hash: Option<&str>,
        now: DateTime<Utc>,
        quiet_queue: &mut Vec<AlertRecord>,
    ) -> Option<AlertRecord> {
        let classification = state.classification;
        let recovering = classification.is_published()
            && state
                .last_alerted_classification
                .is_some_and(|c| !c.is_published());

        let (kind, tier) = if recovering {
            (AlertKind::Recovery, Severity::Info)
        } else if classification.is_published() && state.recovered_at.is_some() {
            return None;
        } else {
            let tier = tier_for(feed, classification, state.delay_minutes)?;
            if let Some(last) = state.last_alerted_tier {
                if tier < last {
                    return None;
                }
                if tier == last {
                    if content_hash != state.last_alerted_hash.as_deref() {
                        debug!(feed = %feed.id, tier = %tier, "Content changed at the same tier, not re-alerting");
                    }
                    return None;
                }
            }
            (AlertKind::Escalation, tier)
        };

        if let Some(last) = state.last_alerted_at {
            if now < last + self.cooldown {
                debug!(
                    feed = %feed.id,
                    tier = %tier,
                    classification = %classification,
                    "Alert suppressed by cooldown"
                );
                return None;
            }
        }

        let record = match kind {
            AlertKind::Recovery => recovery_record(feed, state, now),
            _ => escalation_record(feed, state, tier, now),
        };

        state.last_alerted_hash = content_hash.map(str::to_string);
        state.last_alerted_classification = Some(classification);
        if kind == AlertKind::Recovery {
            state.last_alerted_tier = None;
            state.recovered_at = Some(now);
        } else {
            state.last_alerted_tier = Some(tier);
        }

        if tier < Severity::Critical && self.in_quiet_hours(now) {
            info!(
                feed = %feed.id,
                tier = %tier,
                classification = %classification,
                "Quiet hours, alert held for the summary"
            );
            quiet_queue.push(record);
            return None;
        }

        state.last_alerted_at = Some(state.last_alerted_at.map_or(now, |prev| prev.max(now)));

        info!(
            feed = %feed.id,
            tier = %tier,
            classification = %classification,
            kind = ?kind,
            "Alert raised"
        );
        Some(record)
    }

    /// Collapse the quiet-hours queue into one summary once quiet hours are over.
    pub fn flush_quiet_hours(
        &self,
        queue: &mut Vec<AlertRecord>,
        now: DateTime<Utc>,
    ) -> Option<AlertRecord> {
        if queue.is_empty() || self.in_quiet_hours(now) {
            return None;
        }

        let held = std::mem::take(queue);
        let tier = held
            .iter()
            .map(|a| a.tier)
            .max()
            .unwrap_or(Severity::Info);

        let mut body = String::new();
        for alert in &held {
            let at = alert.created_at.with_timezone(&self.offset).format("%H:%M");
            let _ = writeln!(body, "[{}] {} ({at})", alert.tier, alert.title);
            if !alert.body.is_empty() {
                let _ = writeln!(body, "    {}", alert.body.replace('\n', "\n    "));
            }
        }

        info!(held = held.len(), tier = %tier, "Flushing quiet-hours summary");
        Some(AlertRecord::new(
            QUIET_HOURS_FEED,
            tier,
            AlertKind::QuietHoursSummary,
            format!("{} alert(s) held during quiet hours", held.len()),
            body.trim_end(),
            now,
        ))
    }
}

fn window_line(feed: &FeedDefinition) -> String {
    format!(
        "Expected {}-{} (grace {} min)",
        feed.window.start.format("%H:%M"),
        feed.window.end.format("%H:%M"),
        feed.grace_minutes
    )
}

fn escalation_record(
    feed: &FeedDefinition,
    state: &PublicationState,
    tier: Severity,
    now: DateTime<Utc>,
) -> AlertRecord {
    let name = &feed.display_name;
    let delay = state.delay_minutes.unwrap_or(0);

    let title = match state.classification {
        Classification::Delayed => format!("{name} published {delay} min late"),
        Classification::Missing => format!("{name} not published"),
        Classification::Stale => format!("{name} has not changed"),
        Classification::Unknown => format!("{name} cannot be checked"),
        Classification::Pending | Classification::OnTime => name.clone(),
    };

    let mut lines = vec![window_line(feed)];
    match state.classification {
        Classification::Missing => lines.push(format!("{delay} min past the window end")),
        Classification::Stale => {
            if let Some(changed) = state.content_changed_at {
                lines.push(format!("Unchanged since {}", changed.format("%H:%M UTC")));
            }
        }
        _ => {}
    }
    if let Some(time) = state.published_time {
        lines.push(format!("Published at {}", time.format("%H:%M:%S")));
    }
    if let Some(delta) = &state.comparison {
        lines.push(format!("Previous business day: {}", delta.describe()));
    }
    if let Some(error) = &state.last_error {
        lines.push(format!("Last error: {error}"));
    }

    AlertRecord::new(
        &feed.id,
        tier,
        AlertKind::Escalation,
        title,
        lines.join("\n"),
        now,
    )
}

fn recovery_record(feed: &FeedDefinition, state: &PublicationState, now: DateTime<Utc>) -> AlertRecord {
    let mut lines = Vec::new();
    if let Some(time) = state.published_time {
        lines.push(format!("Published at {}", time.format("%H:%M:%S")));
    }
    if state.classification == Classification::Delayed {
        lines.push(format!(
            "{} min after the window closed",
            state.delay_minutes.unwrap_or(0)
        ));
    }
    if let Some(delta) = &state.comparison {
        lines.push(format!("Previous business day: {}", delta.describe()));
    }

    AlertRecord::new(
        &feed.id,
        Severity::Info,
        AlertKind::Recovery,
        format!("{} published", feed.display_name),
        lines.join("\n"),
        now,
    )
}
