//! Publication state classifier.
//!
//! Decides, from one snapshot and the feed's state so far today, whether the
//! feed is pending, on time, delayed, missing, stale or unobservable. Pure:
//! the same inputs and `now` always produce the same state.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use notify::Severity;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::calendar::Calendar;
use crate::dedup;
use crate::feed::{seconds_of_day, FeedDefinition};
use crate::snapshot::{FeedSnapshot, FetchStatus, Publication};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    #[default]
    Pending,
    OnTime,
    Delayed,
    Missing,
    Stale,
    Unknown,
}

impl Classification {
    /// Today's publication has been observed.
    #[must_use]
    pub const fn is_published(self) -> bool {
        matches!(self, Self::OnTime | Self::Delayed)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::OnTime => "ON_TIME",
            Self::Delayed => "DELAYED",
            Self::Missing => "MISSING",
            Self::Stale => "STALE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Today's publication time compared with the previous business day's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessDayDelta {
    pub previous_date: NaiveDate,
    pub previous_time: NaiveTime,
    pub today_time: NaiveTime,
    pub delta_minutes: i64,
    /// Today's publication came out earlier than the previous one.
    pub earlier: bool,
    /// The previous snapshot is from the calendar's actual previous publication day.
    pub consecutive: bool,
}

impl BusinessDayDelta {
    #[must_use]
    pub fn describe(&self) -> String {
        let direction = if self.earlier { "earlier" } else { "later" };
        let gap = if self.consecutive { "" } else { ", not consecutive" };
        format!(
            "{} min {} than {} ({}{})",
            self.delta_minutes.abs(),
            direction,
            self.previous_date,
            self.previous_time.format("%H:%M"),
            gap
        )
    }
}

/// Per-feed classification plus escalation bookkeeping.
///
/// Fields marked per-day reset when the feed-local day changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublicationState {
    pub feed_id: String,

    /// Feed-local day the per-day fields belong to.
    #[serde(default)]
    pub day: Option<NaiveDate>,

    #[serde(default)]
    pub classification: Classification,

    /// Signed minutes versus the window end (per-day).
    #[serde(default)]
    pub delay_minutes: Option<i64>,

    /// Embedded time of today's publication (per-day).
    #[serde(default)]
    pub published_time: Option<NaiveTime>,

    /// When today's publication was first observed (per-day).
    #[serde(default)]
    pub first_seen_at: Option<DateTime<Utc>>,

    /// Feed has been DELAYED or MISSING today (per-day).
    #[serde(default)]
    pub late_today: bool,

    #[serde(default)]
    pub last_changed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub content_changed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub transport_errors: u32,

    #[serde(default)]
    pub last_error: Option<String>,

    /// Per-day.
    #[serde(default)]
    pub comparison: Option<BusinessDayDelta>,

    /// Per-day; `None` means nothing alerted since the day started or the last recovery.
    #[serde(default)]
    pub last_alerted_tier: Option<Severity>,

    /// Never decreases.
    #[serde(default)]
    pub last_alerted_at: Option<DateTime<Utc>>,

    /// Per-day.
    #[serde(default)]
    pub last_alerted_hash: Option<String>,

    /// Classification the last alert was raised for (per-day).
    #[serde(default)]
    pub last_alerted_classification: Option<Classification>,

    /// Per-day.
    #[serde(default)]
    pub recovered_at: Option<DateTime<Utc>>,
}

impl PublicationState {
    /// Cold-start state: PENDING, nothing alerted.
    pub fn new(feed_id: impl Into<String>) -> Self {
        Self {
            feed_id: feed_id.into(),
            ..Self::default()
        }
    }

    fn start_day(&mut self, day: NaiveDate) {
        self.day = Some(day);
        self.classification = Classification::Pending;
        self.delay_minutes = None;
        self.published_time = None;
        self.first_seen_at = None;
        self.late_today = false;
        self.comparison = None;
        self.last_alerted_tier = None;
        self.last_alerted_hash = None;
        self.last_alerted_classification = None;
        self.recovered_at = None;
    }
}

/// Feed-local view of one instant.
#[derive(Debug, Clone, Copy)]
struct Clock {
    now: DateTime<Utc>,
    today: NaiveDate,
    time: NaiveTime,
}

/// Classifies snapshots for any feed definition.
#[derive(Debug, Clone)]
pub struct Classifier {
    calendar: Calendar,
    transport_error_threshold: u32,
}

impl Classifier {
    #[must_use]
    pub fn new(calendar: Calendar, transport_error_threshold: u32) -> Self {
        Self {
            calendar,
            transport_error_threshold: transport_error_threshold.max(1),
        }
    }

    #[must_use]
    pub fn calendar(&self) -> &Calendar {
        &self.calendar
    }

    /// Derive the next state of `feed` from `snapshot`.
    ///
    /// `previous_snapshot` is the last snapshot that reached the upstream and
    /// drives change detection; `previous_business_day` only annotates.
    pub fn classify(
        &self,
        feed: &FeedDefinition,
        snapshot: &FeedSnapshot,
        previous: &PublicationState,
        previous_snapshot: Option<&FeedSnapshot>,
        previous_business_day: Option<&FeedSnapshot>,
        now: DateTime<Utc>,
    ) -> PublicationState {
        let (today, time) = feed.local(&self.calendar, now);
        let clock = Clock { now, today, time };

        let mut state = previous.clone();
        state.feed_id.clone_from(&feed.id);
        if state.day != Some(today) {
            if state.day.is_some() {
                debug!(feed = %feed.id, day = %today, "New publication day, resetting state");
            }
            state.start_day(today);
        }

        let next = match snapshot.status {
            FetchStatus::TransportError => {
                state.transport_errors = state.transport_errors.saturating_add(1);
                state.last_error.clone_from(&snapshot.error);
                if state.transport_errors >= self.transport_error_threshold {
                    Classification::Unknown
                } else {
                    state.classification
                }
            }
            FetchStatus::Malformed => {
                state.transport_errors = 0;
                state.last_error.clone_from(&snapshot.error);
                state.delay_minutes = None;
                Classification::Unknown
            }
            FetchStatus::Ok => {
                state.transport_errors = 0;
                state.last_error = None;
                if dedup::changed(snapshot, previous_snapshot) {
                    state.content_changed_at = Some(now);
                }
                self.classify_payload(feed, snapshot, previous_business_day, &mut state, clock)
            }
        };

        if next != state.classification {
            debug!(
                feed = %feed.id,
                from = %state.classification,
                to = %next,
                "Classification changed"
            );
            state.last_changed_at = Some(now);
        }
        if matches!(next, Classification::Delayed | Classification::Missing) {
            state.late_today = true;
        }
        state.classification = next;
        state
    }

    fn classify_payload(
        &self,
        feed: &FeedDefinition,
        snapshot: &FeedSnapshot,
        previous_business_day: Option<&FeedSnapshot>,
        state: &mut PublicationState,
        clock: Clock,
    ) -> Classification {
        let todays = snapshot
            .publication
            .as_ref()
            .filter(|p| p.date == clock.today);

        let Some(publication) = todays else {
            if state.published_time.is_some() {
                // Upstream fell back to an older item; keep what was observed today.
                return state.classification;
            }
            state.delay_minutes = None;
            if !feed.publishes_on(&self.calendar, clock.today) {
                return Classification::Pending;
            }
            if seconds_of_day(clock.time) > feed.deadline_secs() {
                state.delay_minutes = Some(feed.minutes_past_end(clock.time));
                return Classification::Missing;
            }
            return Classification::Pending;
        };

        let first_seen = *state.first_seen_at.get_or_insert(clock.now);
        state.published_time = Some(publication.time);
        state.comparison = self.compare(feed, publication, previous_business_day, clock.today);

        let embedded_delay = feed.minutes_past_end(publication.time);
        let (published, delay) = if seconds_of_day(publication.time) > feed.deadline_secs() {
            (Classification::Delayed, embedded_delay)
        } else if state.late_today {
            let (_, seen) = feed.local(&self.calendar, first_seen);
            (
                Classification::Delayed,
                feed.minutes_past_end(seen).max(embedded_delay),
            )
        } else {
            (Classification::OnTime, embedded_delay)
        };
        state.delay_minutes = Some(delay);

        if let (Some(limit), Some(changed_at)) = (feed.stale_after_mins, state.content_changed_at) {
            if clock.now - changed_at > Duration::minutes(i64::from(limit)) {
                return Classification::Stale;
            }
        }
        published
    }

    fn compare(
        &self,
        feed: &FeedDefinition,
        today: &Publication,
        previous: Option<&FeedSnapshot>,
        date: NaiveDate,
    ) -> Option<BusinessDayDelta> {
        let previous = previous?.publication_before(date)?;
        let delta = seconds_of_day(today.time) - seconds_of_day(previous.time);

        Some(BusinessDayDelta {
            previous_date: previous.date,
            previous_time: previous.time,
            today_time: today.time,
            delta_minutes: delta / 60,
            earlier: delta < 0,
            consecutive: feed.previous_publication_day(&self.calendar, date)
                == Some(previous.date),
        })
    }
}
