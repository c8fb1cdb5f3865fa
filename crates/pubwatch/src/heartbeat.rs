//! Liveness file shared between the pipeline and its supervisor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

use crate::error::PersistenceError;
use crate::store::write_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub pid: u32,
    pub beat_at: DateTime<Utc>,
    /// Poll cycles completed since start.
    pub cycles: u64,
    /// Alerts that exhausted their delivery attempts since start.
    pub undelivered_alerts: u64,
}

impl Heartbeat {
    #[must_use]
    pub fn now(cycles: u64, undelivered_alerts: u64) -> Self {
        Self {
            pid: std::process::id(),
            beat_at: Utc::now(),
            cycles,
            undelivered_alerts,
        }
    }

    pub async fn write(&self, path: &Path) -> Result<(), PersistenceError> {
        write_atomic(path, self).await
    }

    /// `Ok(None)` when there is no file or it cannot be parsed yet.
    pub async fn read(path: &Path) -> Result<Option<Self>, PersistenceError> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(serde_json::from_str(&content).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PersistenceError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// A beat stamped ahead of `now` counts as fresh.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        (now - self.beat_at).to_std().map_or(true, |age| age <= max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("heartbeat.json");
        assert_eq!(Heartbeat::read(&path).await.unwrap(), None);

        let beat = Heartbeat::now(42, 1);
        beat.write(&path).await.unwrap();
        assert_eq!(Heartbeat::read(&path).await.unwrap(), Some(beat));
    }

    #[test]
    fn test_freshness() {
        let mut beat = Heartbeat::now(0, 0);
        let now = beat.beat_at;
        assert!(beat.is_fresh(now, Duration::from_secs(90)));

        beat.beat_at = now - chrono::Duration::seconds(91);
        assert!(!beat.is_fresh(now, Duration::from_secs(90)));

        beat.beat_at = now + chrono::Duration::seconds(5);
        assert!(beat.is_fresh(now, Duration::from_secs(90)));
    }
}
