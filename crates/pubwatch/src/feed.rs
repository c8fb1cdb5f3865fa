//! Static feed definitions.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Timelike, Utc, Weekday};
use notify::Severity;
use serde::{Deserialize, Serialize};

use crate::calendar::{hhmm, offset_from_minutes, Calendar};

/// One monitored publication. Immutable after config load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedDefinition {
    pub id: String,

    pub display_name: String,

    /// Path joined to `api.base_url`, or an absolute URL.
    pub source: String,

    pub window: PublicationWindow,

    /// Minutes after the window end before a publication counts as late.
    #[serde(default = "default_grace_minutes")]
    pub grace_minutes: u32,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default)]
    pub thresholds: EscalationThresholds,

    /// Unchanged content past this many minutes turns a published feed STALE.
    #[serde(default)]
    pub stale_after_mins: Option<u32>,

    /// Skip calendar holidays as well as the weekdays not listed in the window.
    #[serde(default = "default_true")]
    pub business_days_only: bool,

    /// Overrides `calendar.utc_offset_minutes` for this feed.
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
}

fn default_grace_minutes() -> u32 {
    10
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationWindow {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,

    #[serde(with = "hhmm")]
    pub end: NaiveTime,

    #[serde(default = "weekdays_mon_fri")]
    pub weekdays: Vec<Weekday>,
}

fn weekdays_mon_fri() -> Vec<Weekday> {
    vec![
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
    ]
}

/// Delay thresholds for DELAYED feeds, and the tier used for MISSING.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationThresholds {
    #[serde(default = "default_warning_after")]
    pub warning_after_mins: u32,

    #[serde(default = "default_critical_after")]
    pub critical_after_mins: u32,

    #[serde(default = "default_missing_tier")]
    pub missing_tier: Severity,
}

fn default_warning_after() -> u32 {
    15
}

fn default_critical_after() -> u32 {
    60
}

fn default_missing_tier() -> Severity {
    Severity::Critical
}

impl Default for EscalationThresholds {
    fn default() -> Self {
        Self {
            warning_after_mins: default_warning_after(),
            critical_after_mins: default_critical_after(),
            missing_tier: default_missing_tier(),
        }
    }
}

impl FeedDefinition {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        source: impl Into<String>,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            source: source.into(),
            window: PublicationWindow {
                start,
                end,
                weekdays: weekdays_mon_fri(),
            },
            grace_minutes: default_grace_minutes(),
            poll_interval_secs: default_poll_interval_secs(),
            thresholds: EscalationThresholds::default(),
            stale_after_mins: None,
            business_days_only: true,
            utc_offset_minutes: None,
        }
    }

    #[must_use]
    pub fn offset(&self, calendar: &Calendar) -> FixedOffset {
        self.utc_offset_minutes
            .map_or_else(|| calendar.offset(), offset_from_minutes)
    }

    /// Feed-local date and time of `now`.
    #[must_use]
    pub fn local(&self, calendar: &Calendar, now: DateTime<Utc>) -> (NaiveDate, NaiveTime) {
        let local = now.with_timezone(&self.offset(calendar));
        (local.date_naive(), local.time())
    }

    /// Whether the feed is expected to publish on `date`.
    #[must_use]
    pub fn publishes_on(&self, calendar: &Calendar, date: NaiveDate) -> bool {
        self.window.weekdays.contains(&date.weekday())
            && !(self.business_days_only && calendar.is_holiday(date))
    }

    /// The last publication day strictly before `date`.
    #[must_use]
    pub fn previous_publication_day(&self, calendar: &Calendar, date: NaiveDate) -> Option<NaiveDate> {
        calendar.previous_matching(date, |d| self.publishes_on(calendar, d))
    }

    /// Seconds after midnight at which a publication stops counting as on time.
    ///
    /// May exceed one day for windows that close just before midnight.
    #[must_use]
    pub fn deadline_secs(&self) -> i64 {
        seconds_of_day(self.window.end) + i64::from(self.grace_minutes) * 60
    }

    /// Signed minutes from the window end to `time`.
    #[must_use]
    pub fn minutes_past_end(&self, time: NaiveTime) -> i64 {
        (seconds_of_day(time) - seconds_of_day(self.window.end)) / 60
    }
}

pub(crate) fn seconds_of_day(time: NaiveTime) -> i64 {
    i64::from(time.num_seconds_from_midnight())
}

/// The publications monitored when no `[[feeds]]` are configured.
#[must_use]
pub fn default_feeds() -> Vec<FeedDefinition> {
    let hm = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN);

    let mut market_watch = FeedDefinition::new(
        "newyork-market-watch",
        "New York market watch",
        "/newyork-market-watch",
        hm(5, 55),
        hm(6, 15),
    );
    market_watch.business_days_only = false;
    market_watch.window.weekdays = vec![
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
    ];

    let kospi = FeedDefinition::new(
        "kospi-close",
        "KOSPI close",
        "/kospi-close",
        hm(15, 35),
        hm(15, 50),
    );

    let exchange_rate = FeedDefinition::new(
        "exchange-rate",
        "Exchange rate close",
        "/exchange-rate",
        hm(16, 25),
        hm(16, 35),
    );

    vec![market_watch, kospi, exchange_rate]
}
