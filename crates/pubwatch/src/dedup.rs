//! Content hashing: "new publication" versus "same payload re-fetched".

use sha2::{Digest, Sha256};

use crate::snapshot::{FeedSnapshot, Publication};

/// SHA-256 over the semantic fields only, hex encoded.
pub fn content_hash(publication: &Publication) -> String {
    let mut hasher = Sha256::new();
    hasher.update(publication.title.as_bytes());
    hasher.update([0x1f]);
    hasher.update(publication.date.format("%Y%m%d").to_string().as_bytes());
    hasher.update([0x1f]);
    hasher.update(publication.time.format("%H%M%S").to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether `new` carries different content than `previous`.
///
/// A snapshot without a payload never counts as a change.
pub fn changed(new: &FeedSnapshot, previous: Option<&FeedSnapshot>) -> bool {
    match (&new.content_hash, previous.and_then(|p| p.content_hash.as_ref())) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(a), Some(b)) => a != b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime, Utc};

    fn snapshot(title: &str, day: u32, minute: u32) -> FeedSnapshot {
        FeedSnapshot::published(
            "kospi-close",
            Utc::now(),
            Publication {
                title: title.to_string(),
                date: NaiveDate::from_ymd_opt(2025, 8, day).unwrap(),
                time: NaiveTime::from_hms_opt(15, minute, 0).unwrap(),
            },
        )
    }

    #[test]
    fn test_same_content_is_unchanged() {
        let a = snapshot("KOSPI close", 12, 38);
        assert!(!changed(&a, Some(&a)));

        // fetch time and raw payload are volatile
        let mut b = snapshot("KOSPI close", 12, 38);
        b.raw = Some(serde_json::json!({"requestId": 7}));
        assert!(!changed(&b, Some(&a)));
    }

    #[test]
    fn test_any_semantic_field_is_a_change() {
        let base = snapshot("KOSPI close", 12, 38);
        assert!(changed(&snapshot("KOSPI close (revised)", 12, 38), Some(&base)));
        assert!(changed(&snapshot("KOSPI close", 13, 38), Some(&base)));
        assert!(changed(&snapshot("KOSPI close", 12, 39), Some(&base)));
    }

    #[test]
    fn test_missing_payloads() {
        let present = snapshot("KOSPI close", 12, 38);
        let empty = FeedSnapshot::empty("kospi-close", Utc::now());
        let failed = FeedSnapshot::transport_error("kospi-close", Utc::now(), "timeout");

        assert!(changed(&present, None));
        assert!(changed(&present, Some(&empty)));
        assert!(!changed(&empty, None));
        assert!(!changed(&empty, Some(&failed)));
        assert!(!changed(&failed, Some(&present)));
    }

    #[test]
    fn test_hash_is_stable_hex() {
        let a = snapshot("KOSPI close", 12, 38);
        let hash = a.content_hash.clone().unwrap();
        assert_eq!(hash.len(), 64);
        assert_eq!(Some(hash), snapshot("KOSPI close", 12, 38).content_hash);
    }
}
