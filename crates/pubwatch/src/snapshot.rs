//! Poll results and the typed publication extracted from a payload.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dedup::content_hash;
use crate::error::ClassificationInputError;

/// The semantic part of a feed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    pub title: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl Publication {
    /// Validate an upstream payload.
    ///
    /// `Ok(None)` means the upstream has nothing published: `null`, an empty
    /// object or list, or an item whose title and date are both empty.
    pub fn from_value(value: &Value) -> Result<Option<Self>, ClassificationInputError> {
        let item = match unwrap_envelope(value) {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Object(map)) if map.is_empty() => return Ok(None),
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(ClassificationInputError(format!(
                    "expected an object, got {}",
                    kind_of(other)
                )))
            }
        };

        let title = field_text(item.get("title"), "title")?.unwrap_or_default();
        let date = field_text(item.get("date"), "date")?.unwrap_or_default();

        if title.is_empty() && date.is_empty() {
            return Ok(None);
        }
        if date.is_empty() {
            return Err(ClassificationInputError("missing date".to_string()));
        }

        let date = parse_date(&date)?;
        let time = match field_text(item.get("time"), "time")? {
            Some(time) if !time.is_empty() => parse_time(&time)?,
            _ => return Err(ClassificationInputError("missing time".to_string())),
        };

        Ok(Some(Self { title, date, time }))
    }
}

fn unwrap_envelope(value: &Value) -> Option<&Value> {
    match value {
        Value::Object(map) if map.len() == 1 && map.contains_key("data") => {
            map.get("data").and_then(unwrap_envelope)
        }
        Value::Array(items) => items.first().and_then(unwrap_envelope),
        other => Some(other),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

/// Upstream fields are usually strings, but numeric dates and times show up too.
fn field_text(
    value: Option<&Value>,
    name: &str,
) -> Result<Option<String>, ClassificationInputError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(Value::Number(n)) if n.is_u64() => Ok(Some(n.to_string())),
        Some(other) => Err(ClassificationInputError(format!(
            "{name} is {}, expected a string",
            kind_of(other)
        ))),
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, ClassificationInputError> {
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .map_err(|_| ClassificationInputError(format!("invalid date '{raw}', expected YYYYMMDD")))
}

fn parse_time(raw: &str) -> Result<NaiveTime, ClassificationInputError> {
    let invalid = || ClassificationInputError(format!("invalid time '{raw}', expected HHMMSS"));

    if raw.contains(':') {
        return NaiveTime::parse_from_str(raw, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
            .map_err(|_| invalid());
    }
    if !raw.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    // Numeric times lose their leading zero: 60000 is 06:00:00.
    let digits = match raw.len() {
        3 | 5 => format!("0{raw}"),
        _ => raw.to_string(),
    };
    let format = match digits.len() {
        6 => "%H%M%S",
        4 => "%H%M",
        _ => return Err(invalid()),
    };
    NaiveTime::parse_from_str(&digits, format).map_err(|_| invalid())
}

/// Outcome of one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Ok,
    TransportError,
    Malformed,
}

/// Result of polling one feed once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSnapshot {
    pub feed_id: String,
    pub fetched_at: DateTime<Utc>,
    pub status: FetchStatus,
    #[serde(default)]
    pub raw: Option<Value>,
    #[serde(default)]
    pub publication: Option<Publication>,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl FeedSnapshot {
    /// Decode a response body. An empty body means nothing is published; a
    /// body that is not JSON is a malformed payload.
    pub fn from_body(feed_id: impl Into<String>, fetched_at: DateTime<Utc>, body: &str) -> Self {
        if body.trim().is_empty() {
            return Self::from_payload(feed_id, fetched_at, Value::Null);
        }
        match serde_json::from_str(body) {
            Ok(raw) => Self::from_payload(feed_id, fetched_at, raw),
            Err(e) => Self::malformed(
                feed_id,
                fetched_at,
                None,
                &ClassificationInputError(format!("response body is not JSON: {e}")),
            ),
        }
    }

    /// Build a snapshot from a fetched payload, validating it on the way.
    pub fn from_payload(feed_id: impl Into<String>, fetched_at: DateTime<Utc>, raw: Value) -> Self {
        match Publication::from_value(&raw) {
            Ok(publication) => Self {
                content_hash: publication.as_ref().map(content_hash),
                feed_id: feed_id.into(),
                fetched_at,
                status: FetchStatus::Ok,
                raw: Some(raw),
                publication,
                error: None,
            },
            Err(e) => Self::malformed(feed_id, fetched_at, Some(raw), &e),
        }
    }

    fn malformed(
        feed_id: impl Into<String>,
        fetched_at: DateTime<Utc>,
        raw: Option<Value>,
        error: &ClassificationInputError,
    ) -> Self {
        Self {
            feed_id: feed_id.into(),
            fetched_at,
            status: FetchStatus::Malformed,
            raw,
            publication: None,
            content_hash: None,
            error: Some(error.to_string()),
        }
    }

    pub fn transport_error(
        feed_id: impl Into<String>,
        fetched_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            feed_id: feed_id.into(),
            fetched_at,
            status: FetchStatus::TransportError,
            raw: None,
            publication: None,
            content_hash: None,
            error: Some(error.into()),
        }
    }

    /// Snapshot with an already-validated publication.
    pub fn published(
        feed_id: impl Into<String>,
        fetched_at: DateTime<Utc>,
        publication: Publication,
    ) -> Self {
        Self {
            feed_id: feed_id.into(),
            fetched_at,
            status: FetchStatus::Ok,
            raw: None,
            content_hash: Some(content_hash(&publication)),
            publication: Some(publication),
            error: None,
        }
    }

    /// Snapshot of an upstream that has nothing published.
    pub fn empty(feed_id: impl Into<String>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            feed_id: feed_id.into(),
            fetched_at,
            status: FetchStatus::Ok,
            raw: None,
            publication: None,
            content_hash: None,
            error: None,
        }
    }

    /// Publication dated strictly before `date`, if any.
    #[must_use]
    pub fn publication_before(&self, date: NaiveDate) -> Option<&Publication> {
        self.publication.as_ref().filter(|p| p.date < date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Result<Option<Publication>, ClassificationInputError> {
        Publication::from_value(&value)
    }

    #[test]
    fn test_parses_string_fields() {
        let p = parse(json!({"title": "KOSPI close", "date": "20250812", "time": "153800"}))
            .unwrap()
            .unwrap();
        assert_eq!(p.title, "KOSPI close");
        assert_eq!(p.date, NaiveDate::from_ymd_opt(2025, 8, 12).unwrap());
        assert_eq!(p.time, NaiveTime::from_hms_opt(15, 38, 0).unwrap());
    }

    #[test]
    fn test_parses_numeric_fields_and_short_times() {
        let p = parse(json!({"title": "NY", "date": 20_250_812, "time": 60_000}))
            .unwrap()
            .unwrap();
        assert_eq!(p.time, NaiveTime::from_hms_opt(6, 0, 0).unwrap());

        let p = parse(json!({"title": "FX", "date": "20250812", "time": "1630"}))
            .unwrap()
            .unwrap();
        assert_eq!(p.time, NaiveTime::from_hms_opt(16, 30, 0).unwrap());
    }

    #[test]
    fn test_unwraps_data_envelope_and_lists() {
        let item = json!({"title": "FX", "date": "20250812", "time": "163000"});
        assert!(parse(json!({"data": item.clone()})).unwrap().is_some());
        assert!(parse(json!([item])).unwrap().is_some());
        assert!(parse(json!({"data": []})).unwrap().is_none());
    }

    #[test]
    fn test_empty_payloads_mean_not_published() {
        assert_eq!(parse(Value::Null).unwrap(), None);
        assert_eq!(parse(json!({})).unwrap(), None);
        assert_eq!(parse(json!({"title": "", "date": ""})).unwrap(), None);
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(parse(json!("published")).is_err());
        assert!(parse(json!({"title": "x", "date": "2025-13-40", "time": "1200"})).is_err());
        assert!(parse(json!({"title": "x", "date": "20250812", "time": "99"})).is_err());
        assert!(parse(json!({"title": "x", "date": "20250812"})).is_err());
        assert!(parse(json!({"title": "x", "time": "1200"})).is_err());
        assert!(parse(json!({"title": ["x"], "date": "20250812", "time": "1200"})).is_err());
    }

    #[test]
    fn test_snapshot_from_malformed_payload() {
        let snapshot = FeedSnapshot::from_payload("fx", Utc::now(), json!({"date": "yesterday"}));
        assert_eq!(snapshot.status, FetchStatus::Malformed);
        assert!(snapshot.error.unwrap().contains("invalid date"));
        assert!(snapshot.content_hash.is_none());
    }

    #[test]
    fn test_snapshot_from_body() {
        let snapshot = FeedSnapshot::from_body("fx", Utc::now(), "Service Unavailable");
        assert_eq!(snapshot.status, FetchStatus::Malformed);
        assert!(snapshot.raw.is_none());
        assert!(snapshot.error.unwrap().starts_with("malformed payload: response body is not JSON"));

        let snapshot = FeedSnapshot::from_body("fx", Utc::now(), "\n");
        assert_eq!(snapshot.status, FetchStatus::Ok);
        assert!(snapshot.publication.is_none());
    }
}
