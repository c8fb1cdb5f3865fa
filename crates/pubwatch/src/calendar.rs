//! Business-day calendar.
//!
//! "Today" is always the calendar-local day (fixed UTC offset), never the UTC
//! day. Holidays are listed explicitly in config.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, Offset, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How far back [`Calendar::previous_matching`] walks before giving up.
pub const MAX_LOOKBACK_DAYS: i64 = 10;

/// Korea Standard Time, the offset every built-in feed publishes in.
pub const KST_OFFSET_MINUTES: i32 = 9 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calendar {
    /// Offset of the publication calendar from UTC, in minutes.
    #[serde(default = "default_offset")]
    pub utc_offset_minutes: i32,

    /// Dates on which business-day feeds do not publish (`YYYY-MM-DD`).
    #[serde(default)]
    pub holidays: BTreeSet<NaiveDate>,
}

fn default_offset() -> i32 {
    KST_OFFSET_MINUTES
}

impl Default for Calendar {
    fn default() -> Self {
        Self {
            utc_offset_minutes: KST_OFFSET_MINUTES,
            holidays: BTreeSet::new(),
        }
    }
}

impl Calendar {
    #[must_use]
    pub fn offset(&self) -> FixedOffset {
        offset_from_minutes(self.utc_offset_minutes)
    }

    /// The calendar-local date of `now`.
    #[must_use]
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset()).date_naive()
    }

    #[must_use]
    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.contains(&date)
    }

    /// Monday to Friday and not a listed holiday.
    #[must_use]
    pub fn is_business_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.is_holiday(date)
    }

    #[must_use]
    pub fn previous_business_day(&self, date: NaiveDate) -> Option<NaiveDate> {
        self.previous_matching(date, |d| self.is_business_day(d))
    }

    /// Walk back from the day before `date` to the first day accepted by
    /// `accept`, looking at most [`MAX_LOOKBACK_DAYS`] days back.
    pub fn previous_matching(
        &self,
        date: NaiveDate,
        accept: impl Fn(NaiveDate) -> bool,
    ) -> Option<NaiveDate> {
        (1..=MAX_LOOKBACK_DAYS)
            .filter_map(|back| date.checked_sub_signed(Duration::days(back)))
            .find(|d| accept(*d))
    }

    /// Holidays observed by the Korean exchanges in 2025.
    #[must_use]
    pub fn korean_2025() -> Self {
        let holidays = [
            (1, 1),
            (1, 28),
            (1, 29),
            (1, 30),
            (3, 3),
            (5, 5),
            (5, 6),
            (6, 3),
            (6, 6),
            (8, 15),
            (10, 3),
            (10, 6),
            (10, 7),
            (10, 8),
            (10, 9),
            (12, 25),
            (12, 31),
        ]
        .into_iter()
        .filter_map(|(m, d)| NaiveDate::from_ymd_opt(2025, m, d))
        .collect();

        Self {
            utc_offset_minutes: KST_OFFSET_MINUTES,
            holidays,
        }
    }
}

/// Out-of-range offsets fall back to UTC; `Config::validate` rejects them first.
pub(crate) fn offset_from_minutes(minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(minutes * 60).unwrap_or_else(|| Utc.fix())
}

/// Time-of-day as `"HH:MM"` (seconds accepted on input).
pub(crate) mod hhmm {
    use chrono::NaiveTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn parse(s: &str) -> Option<NaiveTime> {
        NaiveTime::parse_from_str(s, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
            .ok()
    }

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).ok_or_else(|| de::Error::custom(format!("invalid time of day '{s}', expected HH:MM")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_local_date_uses_offset() {
        let cal = Calendar::default();
        // 15:30 UTC is 00:30 the next day in KST
        let now = Utc.with_ymd_and_hms(2025, 8, 11, 15, 30, 0).unwrap();
        assert_eq!(cal.local_date(now), date(2025, 8, 12));
    }

    #[test]
    fn test_business_day_skips_weekend_and_holidays() {
        let cal = Calendar::korean_2025();
        assert!(cal.is_business_day(date(2025, 8, 14)));
        assert!(!cal.is_business_day(date(2025, 8, 15)));
        assert!(!cal.is_business_day(date(2025, 8, 16)));
        assert!(!cal.is_business_day(date(2025, 8, 17)));
    }

    #[test]
    fn test_previous_business_day() {
        let cal = Calendar::korean_2025();
        // Monday after a Friday holiday goes back to Thursday
        assert_eq!(
            cal.previous_business_day(date(2025, 8, 18)),
            Some(date(2025, 8, 14))
        );
        // Chuseok week: Oct 3-9 closed, Oct 10 opens after Oct 2
        assert_eq!(
            cal.previous_business_day(date(2025, 10, 10)),
            Some(date(2025, 10, 2))
        );
    }

    #[test]
    fn test_previous_matching_is_bounded() {
        let cal = Calendar::default();
        assert_eq!(cal.previous_matching(date(2025, 8, 18), |_| false), None);
    }

    #[test]
    fn test_hhmm_parse() {
        assert_eq!(
            hhmm::parse("15:40"),
            chrono::NaiveTime::from_hms_opt(15, 40, 0)
        );
        assert_eq!(
            hhmm::parse("06:15:30"),
            chrono::NaiveTime::from_hms_opt(6, 15, 30)
        );
        assert_eq!(hhmm::parse("25:00"), None);
    }
}
