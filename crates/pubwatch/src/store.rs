//! File-backed state store.
//!
//! One JSON document per process, guarded by a single async mutex. Every
//! mutation goes through [`StateStore::update`], which persists before the
//! lock is released; if the write fails the in-memory document is left as it
//! was so memory never runs ahead of disk.

use chrono::{DateTime, NaiveDate, Utc};
use notify::AlertRecord;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::classifier::PublicationState;
use crate::error::PersistenceError;
use crate::snapshot::{FeedSnapshot, FetchStatus};

/// Undeliverable alerts kept in the monitor document.
pub const UNDELIVERED_CAP: usize = 100;

pub struct StateStore<D> {
    path: PathBuf,
    doc: Mutex<D>,
}

impl<D> StateStore<D>
where
    D: Serialize + DeserializeOwned + Default + Clone + Send,
{
    /// Load the document at `path`.
    ///
    /// A missing file is a cold start. A corrupt file is moved aside to
    /// `<name>.corrupt` and also treated as a cold start.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        let doc = load(&path).await?;
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A copy of the current document.
    pub async fn snapshot(&self) -> D {
        self.doc.lock().await.clone()
    }

    /// Mutate the document and persist it under the lock.
    pub async fn update<R>(&self, f: impl FnOnce(&mut D) -> R) -> Result<R, PersistenceError> {
        let mut doc = self.doc.lock().await;
        let mut next = doc.clone();
        let out = f(&mut next);
        write_atomic(&self.path, &next).await?;
        *doc = next;
        Ok(out)
    }

    /// Write the current document again.
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        let doc = self.doc.lock().await;
        write_atomic(&self.path, &*doc).await
    }
}

async fn load<D>(path: &Path) -> Result<D, PersistenceError>
where
    D: DeserializeOwned + Default,
{
    match fs::read_to_string(path).await {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(doc) => {
                debug!(path = %path.display(), "State loaded");
                Ok(doc)
            }
            Err(e) => {
                let aside = sibling(path, "corrupt");
                warn!(
                    path = %path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "State file is corrupt, starting cold"
                );
                if let Err(e) = fs::rename(path, &aside).await {
                    warn!(error = %e, "Failed to move corrupt state file aside");
                }
                Ok(D::default())
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No state file, starting cold");
            Ok(D::default())
        }
        Err(source) => Err(PersistenceError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Serialize `value` to `path` through a temp file and a rename.
pub async fn write_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), PersistenceError> {
    let content = serde_json::to_vec_pretty(value)?;
    let write_err = |source| PersistenceError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let tmp = sibling(path, "tmp");
    fs::write(&tmp, content).await.map_err(write_err)?;
    fs::rename(&tmp, path).await.map_err(write_err)
}

/// `state.json` -> `state.json.<suffix>`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("state"));
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Everything the monitor process persists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorState {
    #[serde(default)]
    pub feeds: BTreeMap<String, FeedRecord>,

    /// INFO/WARNING alerts held until quiet hours end.
    #[serde(default)]
    pub quiet_queue: Vec<AlertRecord>,

    /// Alerts the dispatcher had not delivered at the last shutdown.
    #[serde(default)]
    pub pending_alerts: Vec<AlertRecord>,

    /// Alerts that exhausted their delivery attempts, newest last.
    #[serde(default)]
    pub undelivered: Vec<AlertRecord>,

    /// Calendar-local day the last daily summary covered.
    #[serde(default)]
    pub last_daily_summary: Option<NaiveDate>,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl MonitorState {
    pub fn record_mut(&mut self, feed_id: &str) -> &mut FeedRecord {
        self.feeds
            .entry(feed_id.to_string())
            .or_insert_with(|| FeedRecord::new(feed_id))
    }

    pub fn archive_undelivered(&mut self, alert: AlertRecord) {
        self.undelivered.push(alert);
        if self.undelivered.len() > UNDELIVERED_CAP {
            let excess = self.undelivered.len() - UNDELIVERED_CAP;
            self.undelivered.drain(..excess);
        }
    }
}

/// Per-feed durable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedRecord {
    pub state: PublicationState,

    /// Last snapshot that reached the upstream.
    #[serde(default)]
    pub latest: Option<FeedSnapshot>,

    /// Most recent snapshot whose publication predates the current day.
    #[serde(default)]
    pub previous_business_day: Option<FeedSnapshot>,
}

impl FeedRecord {
    pub fn new(feed_id: &str) -> Self {
        Self {
            state: PublicationState::new(feed_id),
            latest: None,
            previous_business_day: None,
        }
    }

    /// Snapshot to compare today's publication against.
    pub fn comparison_base(&self, today: NaiveDate) -> Option<&FeedSnapshot> {
        self.latest
            .as_ref()
            .filter(|s| s.publication_before(today).is_some())
            .or_else(|| {
                self.previous_business_day
                    .as_ref()
                    .filter(|s| s.publication_before(today).is_some())
            })
    }

    /// Keep `snapshot` as the latest observation. Failed fetches and
    /// malformed payloads carry no content and are not kept, so change
    /// detection keeps comparing against the last good payload.
    pub fn retain(&mut self, snapshot: FeedSnapshot, today: NaiveDate) {
        if snapshot.status != FetchStatus::Ok {
            return;
        }
        if let Some(previous) = self.latest.replace(snapshot) {
            if previous.publication_before(today).is_some() {
                self.previous_business_day = Some(previous);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::tests::{kst, published};
    use crate::classifier::Classification;
    use notify::{AlertKind, Severity};
    use tempfile::TempDir;

    fn alert(n: usize) -> AlertRecord {
        AlertRecord::new(
            "kospi-close",
            Severity::Warning,
            AlertKind::Escalation,
            format!("alert {n}"),
            "",
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_cold_start_when_absent() {
        let dir = TempDir::new().unwrap();
        let store: StateStore<MonitorState> =
            StateStore::open(dir.path().join("state.json")).await.unwrap();
        assert_eq!(store.snapshot().await, MonitorState::default());
        assert!(!dir.path().join("state.json").exists());
    }

    #[tokio::test]
    async fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/state.json");
        let store: StateStore<MonitorState> = StateStore::open(&path).await.unwrap();

        store
            .update(|doc| {
                let record = doc.record_mut("kospi-close");
                record.state.classification = Classification::Delayed;
                record.state.delay_minutes = Some(25);
                record.state.last_alerted_tier = Some(Severity::Warning);
                record.state.last_alerted_at = Some(kst(12, 16, 6));
                record.retain(published(12, 16, 5, kst(12, 16, 6)), kst(12, 16, 6).date_naive());
                doc.quiet_queue.push(alert(1));
            })
            .await
            .unwrap();

        let reopened: StateStore<MonitorState> = StateStore::open(&path).await.unwrap();
        assert_eq!(reopened.snapshot().await, store.snapshot().await);
        assert!(!dir.path().join("nested/state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_moved_aside() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store: StateStore<MonitorState> = StateStore::open(&path).await.unwrap();
        assert_eq!(store.snapshot().await, MonitorState::default());
        assert!(dir.path().join("state.json.corrupt").exists());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_untouched() {
        let dir = TempDir::new().unwrap();
        let parent = dir.path().join("state");
        let store: StateStore<MonitorState> =
            StateStore::open(parent.join("state.json")).await.unwrap();

        // a plain file where the state directory should be
        std::fs::write(&parent, "").unwrap();
        let result = store.update(|doc| doc.quiet_queue.push(alert(1))).await;

        assert!(matches!(result, Err(PersistenceError::Write { .. })));
        assert!(store.snapshot().await.quiet_queue.is_empty());
    }

    #[test]
    fn test_undelivered_is_capped() {
        let mut doc = MonitorState::default();
        for n in 0..UNDELIVERED_CAP + 5 {
            doc.archive_undelivered(alert(n));
        }
        assert_eq!(doc.undelivered.len(), UNDELIVERED_CAP);
        assert_eq!(doc.undelivered[0].title, "alert 5");
    }

    #[test]
    fn test_retain_keeps_previous_business_day() {
        let today = kst(12, 15, 0).date_naive();
        let mut record = FeedRecord::new("kospi-close");

        record.retain(published(11, 15, 36, kst(12, 9, 0)), today);
        assert_eq!(record.comparison_base(today), record.latest.as_ref());

        record.retain(
            FeedSnapshot::transport_error("kospi-close", kst(12, 9, 1), "timeout"),
            today,
        );
        assert_eq!(record.latest.as_ref().unwrap().status, FetchStatus::Ok);

        record.retain(
            FeedSnapshot::from_payload("kospi-close", kst(12, 9, 2), serde_json::json!("oops")),
            today,
        );
        assert_eq!(record.latest.as_ref().unwrap().status, FetchStatus::Ok);

        record.retain(published(12, 15, 38, kst(12, 15, 39)), today);
        let base = record.comparison_base(today).unwrap();
        assert_eq!(base.publication.as_ref().unwrap().date.to_string(), "2025-08-11");
    }
}
