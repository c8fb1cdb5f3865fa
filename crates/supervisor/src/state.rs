//! Persisted supervisor document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[default]
    Stopped,
    Starting,
    Running,
    Restarting,
    Updating,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Restarting => "RESTARTING",
            Self::Updating => "UPDATING",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorState {
    pub pid: Option<u32>,
    pub phase: Phase,
    pub consecutive_crash_count: u32,
    pub last_restart_at: Option<DateTime<Utc>>,
    pub last_remote_check_at: Option<DateTime<Utc>>,
    pub last_applied_revision: Option<String>,
    /// Revision to return to if the update being applied proves bad.
    pub rollback_point: Option<String>,
    /// A revision that was rolled back; never applied again.
    pub rejected_revision: Option<String>,
    pub failed_reason: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SupervisorState {
    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.updated_at = Some(Utc::now());
    }

    /// Clear FAILED so the next launch starts the pipeline again.
    pub fn reset(&mut self) {
        self.set_phase(Phase::Stopped);
        self.pid = None;
        self.consecutive_crash_count = 0;
        self.failed_reason = None;
        self.rollback_point = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pubwatch::StateStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_round_trip_through_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("supervisor.json");

        let store = StateStore::<SupervisorState>::open(&path).await.unwrap();
        let written = store
            .update(|doc| {
                doc.set_phase(Phase::Running);
                doc.pid = Some(4242);
                doc.consecutive_crash_count = 2;
                doc.last_applied_revision = Some("abc123".to_string());
                doc.rejected_revision = Some("def456".to_string());
                doc.clone()
            })
            .await
            .unwrap();

        let reopened = StateStore::<SupervisorState>::open(&path).await.unwrap();
        assert_eq!(reopened.snapshot().await, written);
    }

    #[test]
    fn test_reset_clears_failure_but_keeps_revisions() {
        let mut doc = SupervisorState {
            phase: Phase::Failed,
            consecutive_crash_count: 5,
            failed_reason: Some("crashed".to_string()),
            last_applied_revision: Some("abc".to_string()),
            rejected_revision: Some("def".to_string()),
            ..SupervisorState::default()
        };
        doc.reset();
        assert_eq!(doc.phase, Phase::Stopped);
        assert_eq!(doc.consecutive_crash_count, 0);
        assert_eq!(doc.failed_reason, None);
        assert_eq!(doc.last_applied_revision.as_deref(), Some("abc"));
        assert_eq!(doc.rejected_revision.as_deref(), Some("def"));
    }

    #[test]
    fn test_phase_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&Phase::Restarting).unwrap(), "\"RESTARTING\"");
    }
}
