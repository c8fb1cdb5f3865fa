//! Configuration.
//!
//! Loaded once from TOML at startup, overridden from the environment, then
//! validated and shared as `Arc<Config>`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::calendar::{hhmm, Calendar};
use crate::error::ConfigError;
use crate::escalation::QuietHours;
use crate::feed::{default_feeds, FeedDefinition};

pub const DEFAULT_CONFIG_PATH: &str = "pubwatch.toml";

pub const ENV_CONFIG: &str = "PUBWATCH_CONFIG";
pub const ENV_WEBHOOK_URL: &str = "PUBWATCH_WEBHOOK_URL";
pub const ENV_API_BASE_URL: &str = "PUBWATCH_API_BASE_URL";
pub const ENV_API_TOKEN: &str = "PUBWATCH_API_TOKEN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "Calendar::korean_2025")]
    pub calendar: Calendar,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,

    #[serde(default)]
    pub escalation: EscalationConfig,

    #[serde(default)]
    pub state: StateConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default = "default_feeds")]
    pub feeds: Vec<FeedDefinition>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            calendar: Calendar::korean_2025(),
            api: ApiConfig::default(),
            webhook: WebhookConfig::default(),
            escalation: EscalationConfig::default(),
            state: StateConfig::default(),
            supervisor: SupervisorConfig::default(),
            feeds: default_feeds(),
        }
    }
}

/// Upstream feed API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_concurrent_polls")]
    pub max_concurrent_polls: usize,

    /// Consecutive transport errors before a feed becomes UNKNOWN.
    #[serde(default = "default_transport_error_threshold")]
    pub transport_error_threshold: u32,
}

fn default_api_timeout() -> u64 {
    10
}

fn default_max_concurrent_polls() -> usize {
    4
}

fn default_transport_error_threshold() -> u32 {
    3
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            timeout_secs: default_api_timeout(),
            max_concurrent_polls: default_max_concurrent_polls(),
            transport_error_threshold: default_transport_error_threshold(),
        }
    }
}

/// Alert delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_bot_name")]
    pub bot_name: String,

    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_retry_base")]
    pub retry_base_secs: u64,

    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,

    #[serde(default = "default_retry_cap")]
    pub retry_cap_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// How long the dispatcher keeps delivering after shutdown starts.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    #[serde(default)]
    pub disabled: bool,
}

fn default_bot_name() -> String {
    "pubwatch".to_string()
}

fn default_webhook_timeout() -> u64 {
    10
}

fn default_retry_base() -> u64 {
    2
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_cap() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    5
}

fn default_drain_timeout() -> u64 {
    5
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            bot_name: default_bot_name(),
            timeout_secs: default_webhook_timeout(),
            retry_base_secs: default_retry_base(),
            retry_multiplier: default_retry_multiplier(),
            retry_cap_secs: default_retry_cap(),
            max_attempts: default_max_attempts(),
            drain_timeout_secs: default_drain_timeout(),
            disabled: false,
        }
    }
}

impl WebhookConfig {
    pub fn retry_policy(&self) -> notify::RetryPolicy {
        notify::RetryPolicy {
            base: Duration::from_secs(self.retry_base_secs),
            multiplier: self.retry_multiplier,
            cap: Duration::from_secs(self.retry_cap_secs),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationConfig {
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,

    #[serde(default = "default_quiet_hours")]
    pub quiet_hours: Option<QuietHours>,

    /// Consecutive failed state writes before a CRITICAL alert.
    #[serde(default = "default_persistence_alert_after")]
    pub persistence_alert_after: u32,

    #[serde(default = "default_daily_summary")]
    pub daily_summary: Option<DailySummary>,
}

/// One INFO digest of every feed, sent once per calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySummary {
    /// Calendar-local time after which the day's summary goes out.
    #[serde(with = "hhmm")]
    pub at: chrono::NaiveTime,
}

fn default_cooldown() -> u64 {
    600
}

fn default_quiet_hours() -> Option<QuietHours> {
    Some(QuietHours {
        start: chrono::NaiveTime::from_hms_opt(19, 0, 0).unwrap_or_default(),
        end: chrono::NaiveTime::from_hms_opt(6, 0, 0).unwrap_or_default(),
    })
}

fn default_persistence_alert_after() -> u32 {
    3
}

fn default_daily_summary() -> Option<DailySummary> {
    Some(DailySummary {
        at: chrono::NaiveTime::from_hms_opt(18, 0, 0).unwrap_or_default(),
    })
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: default_cooldown(),
            quiet_hours: default_quiet_hours(),
            persistence_alert_after: default_persistence_alert_after(),
            daily_summary: default_daily_summary(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,

    #[serde(default = "default_heartbeat_path")]
    pub heartbeat_path: PathBuf,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Upper bound on waiting for in-flight polls at shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_state_path() -> PathBuf {
    PathBuf::from("state/pubwatch.json")
}

fn default_heartbeat_path() -> PathBuf {
    PathBuf::from("state/heartbeat.json")
}

fn default_heartbeat_interval() -> u64 {
    15
}

fn default_shutdown_timeout() -> u64 {
    10
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
            heartbeat_path: default_heartbeat_path(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

/// Settings read by `pubwatch-supervisor` only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Child command line. Empty means `pubwatch run` next to the supervisor binary.
    #[serde(default)]
    pub command: Vec<String>,

    /// Working directory of the child and of git operations.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default = "default_supervisor_state_path")]
    pub state_path: PathBuf,

    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    #[serde(default = "default_heartbeat_max_age")]
    pub heartbeat_max_age_secs: u64,

    #[serde(default = "default_backoff_base")]
    pub restart_backoff_base_secs: u64,

    #[serde(default = "default_backoff_cap")]
    pub restart_backoff_cap_secs: u64,

    #[serde(default = "default_max_crashes")]
    pub max_consecutive_crashes: u32,

    /// Healthy time after which the crash count starts over.
    #[serde(default = "default_crash_reset_after")]
    pub crash_reset_after_secs: u64,

    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub auto_update: bool,

    #[serde(default = "default_update_check_interval")]
    pub update_check_interval_secs: u64,

    #[serde(default = "default_remote")]
    pub remote: String,

    #[serde(default = "default_branch")]
    pub branch: String,

    #[serde(default = "default_update_grace")]
    pub update_grace_secs: u64,

    #[serde(default = "default_update_probe_interval")]
    pub update_probe_interval_secs: u64,

    #[serde(default = "default_update_probe_failures")]
    pub update_probe_failures: u32,

    #[serde(default = "default_git_timeout")]
    pub git_timeout_secs: u64,

    /// Seconds between INFO status reports; 0 disables them.
    #[serde(default = "default_status_report_interval")]
    pub status_report_interval_secs: u64,
}

fn default_supervisor_state_path() -> PathBuf {
    PathBuf::from("state/supervisor.json")
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_heartbeat_max_age() -> u64 {
    90
}

fn default_backoff_base() -> u64 {
    5
}

fn default_backoff_cap() -> u64 {
    300
}

fn default_max_crashes() -> u32 {
    5
}

fn default_crash_reset_after() -> u64 {
    600
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_update_check_interval() -> u64 {
    3600
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_update_grace() -> u64 {
    120
}

fn default_update_probe_interval() -> u64 {
    10
}

fn default_update_probe_failures() -> u32 {
    2
}

fn default_git_timeout() -> u64 {
    30
}

fn default_status_report_interval() -> u64 {
    7200
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            working_dir: None,
            state_path: default_supervisor_state_path(),
            health_check_interval_secs: default_health_check_interval(),
            heartbeat_max_age_secs: default_heartbeat_max_age(),
            restart_backoff_base_secs: default_backoff_base(),
            restart_backoff_cap_secs: default_backoff_cap(),
            max_consecutive_crashes: default_max_crashes(),
            crash_reset_after_secs: default_crash_reset_after(),
            stop_timeout_secs: default_stop_timeout(),
            auto_update: true,
            update_check_interval_secs: default_update_check_interval(),
            remote: default_remote(),
            branch: default_branch(),
            update_grace_secs: default_update_grace(),
            update_probe_interval_secs: default_update_probe_interval(),
            update_probe_failures: default_update_probe_failures(),
            git_timeout_secs: default_git_timeout(),
            status_report_interval_secs: default_status_report_interval(),
        }
    }
}

impl Config {
    /// Read, override from the environment, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file at the default path means defaults.
    pub fn load_or_default(path: &Path, explicit: bool) -> Result<Self, ConfigError> {
        if !explicit && !path.exists() {
            let mut config = Self::default();
            config.apply_env();
            config.validate()?;
            return Ok(config);
        }
        Self::load(path)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Environment overrides, applied once after parsing.
    pub fn apply_env(&mut self) {
        if let Some(url) = std::env::var(ENV_WEBHOOK_URL).ok().filter(|v| !v.is_empty()) {
            self.webhook.url = Some(url);
        }
        if let Some(url) = std::env::var(ENV_API_BASE_URL).ok().filter(|v| !v.is_empty()) {
            self.api.base_url = Some(url);
        }
        if let Some(token) = std::env::var(ENV_API_TOKEN).ok().filter(|v| !v.is_empty()) {
            self.api.token = Some(token);
        }
        if notify::disabled_from_env() {
            self.webhook.disabled = true;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.feeds.is_empty() {
            return invalid("no feeds configured".to_string());
        }
        if !(-14 * 60..=14 * 60).contains(&self.calendar.utc_offset_minutes) {
            return invalid(format!(
                "calendar.utc_offset_minutes {} is out of range",
                self.calendar.utc_offset_minutes
            ));
        }
        if self.api.max_concurrent_polls == 0 {
            return invalid("api.max_concurrent_polls must be at least 1".to_string());
        }
        if self.api.timeout_secs == 0 || self.webhook.timeout_secs == 0 {
            return invalid("timeouts must be greater than zero".to_string());
        }
        if self.webhook.max_attempts == 0 {
            return invalid("webhook.max_attempts must be at least 1".to_string());
        }
        if self.webhook.retry_multiplier < 1.0 {
            return invalid("webhook.retry_multiplier must be at least 1.0".to_string());
        }
        if let Some(quiet) = &self.escalation.quiet_hours {
            if quiet.start == quiet.end {
                return invalid("escalation.quiet_hours start and end must differ".to_string());
            }
        }
        if self.state.heartbeat_interval_secs == 0 {
            return invalid("state.heartbeat_interval_secs must be greater than zero".to_string());
        }

        let sup = &self.supervisor;
        if sup.health_check_interval_secs == 0
            || sup.update_check_interval_secs == 0
            || sup.update_probe_interval_secs == 0
        {
            return invalid("supervisor intervals must be greater than zero".to_string());
        }
        if sup.max_consecutive_crashes == 0 || sup.update_probe_failures == 0 {
            return invalid(
                "supervisor.max_consecutive_crashes and update_probe_failures must be at least 1"
                    .to_string(),
            );
        }
        if sup.restart_backoff_base_secs > sup.restart_backoff_cap_secs {
            return invalid("supervisor.restart_backoff_base_secs exceeds the cap".to_string());
        }
        if sup.heartbeat_max_age_secs <= self.state.heartbeat_interval_secs {
            return invalid(
                "supervisor.heartbeat_max_age_secs must exceed state.heartbeat_interval_secs"
                    .to_string(),
            );
        }

        let mut seen = HashSet::new();
        for feed in &self.feeds {
            if feed.id.trim().is_empty() {
                return invalid("feed id must not be empty".to_string());
            }
            if !seen.insert(feed.id.as_str()) {
                return invalid(format!("duplicate feed id '{}'", feed.id));
            }
            if feed.poll_interval_secs == 0 {
                return invalid(format!("feed '{}': poll_interval_secs must be greater than zero", feed.id));
            }
            if feed.window.end < feed.window.start {
                return invalid(format!("feed '{}': window ends before it starts", feed.id));
            }
            if feed.window.weekdays.is_empty() {
                return invalid(format!("feed '{}': no publication weekdays", feed.id));
            }
            if feed.thresholds.warning_after_mins > feed.thresholds.critical_after_mins {
                return invalid(format!(
                    "feed '{}': warning_after_mins exceeds critical_after_mins",
                    feed.id
                ));
            }
            if feed.stale_after_mins == Some(0) {
                return invalid(format!("feed '{}': stale_after_mins must be greater than zero", feed.id));
            }
            if let Some(offset) = feed.utc_offset_minutes {
                if !(-14 * 60..=14 * 60).contains(&offset) {
                    return invalid(format!("feed '{}': utc_offset_minutes {offset} is out of range", feed.id));
                }
            }
        }

        Ok(())
    }

    pub fn feed(&self, id: &str) -> Option<&FeedDefinition> {
        self.feeds.iter().find(|f| f.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::Severity;

    const SAMPLE: &str = r#"
[calendar]
utc_offset_minutes = 540
holidays = ["2025-08-15"]

[api]
base_url = "https://api.example.com"
max_concurrent_polls = 2

[webhook]
url = "https://hooks.example.com/abc"

[escalation]
cooldown_seconds = 300
quiet_hours = { start = "19:00", end = "06:00" }

[[feeds]]
id = "kospi-close"
display_name = "KOSPI close"
source = "/kospi-close"
window = { start = "15:35", end = "15:50" }
thresholds = { warning_after_mins = 10, critical_after_mins = 45, missing_tier = "warning" }
stale_after_mins = 120
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.calendar.holidays.len(), 1);
        assert_eq!(config.api.max_concurrent_polls, 2);
        assert_eq!(config.escalation.cooldown_seconds, 300);
        assert_eq!(config.feeds.len(), 1);

        let feed = config.feed("kospi-close").unwrap();
        assert_eq!(feed.grace_minutes, 10);
        assert_eq!(feed.poll_interval_secs, 60);
        assert_eq!(feed.thresholds.missing_tier, Severity::Warning);
        assert_eq!(feed.stale_after_mins, Some(120));
        assert_eq!(feed.window.weekdays.len(), 5);
        assert!(feed.business_days_only);
    }

    #[test]
    fn test_defaults_when_empty() {
        let config = Config::from_toml_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.feeds.len(), 3);
        assert_eq!(config.feeds[1].id, "kospi-close");
        assert_eq!(config.calendar.utc_offset_minutes, 540);
        assert_eq!(config.supervisor.update_probe_failures, 2);
        assert_eq!(config.supervisor.status_report_interval_secs, 7200);
        assert!(config.escalation.quiet_hours.is_some());
        assert_eq!(
            config.escalation.daily_summary.map(|d| d.at),
            chrono::NaiveTime::from_hms_opt(18, 0, 0)
        );
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let mut config = Config::default();
        config.feeds.push(config.feeds[0].clone());
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate feed id"), "{err}");
    }

    #[test]
    fn test_rejects_inverted_window_and_thresholds() {
        let mut config = Config::default();
        config.feeds[0].window.end = chrono::NaiveTime::from_hms_opt(5, 0, 0).unwrap();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.feeds[0].thresholds.warning_after_mins = 90;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_interval() {
        let mut config = Config::default();
        config.feeds[2].poll_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_quiet_hours() {
        let bad = "[escalation]\nquiet_hours = { start = \"24:30\", end = \"06:00\" }\n";
        assert!(Config::from_toml_str(bad).is_err());
    }

    #[test]
    fn test_example_file_matches_defaults() {
        let example = include_str!("../../../pubwatch.example.toml");
        let config = Config::from_toml_str(example).unwrap();
        config.validate().unwrap();

        let defaults = Config::default();
        assert_eq!(config.feeds.len(), defaults.feeds.len());
        assert_eq!(config.feeds[0].window, defaults.feeds[0].window);
        assert_eq!(config.calendar, defaults.calendar);
        assert_eq!(config.escalation, defaults.escalation);
        assert!(!config.supervisor.auto_update);
        assert_eq!(
            config.supervisor.status_report_interval_secs,
            defaults.supervisor.status_report_interval_secs
        );
    }

    #[test]
    fn test_missing_default_file_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_PATH);
        assert!(Config::load_or_default(&path, false).is_ok());
        assert!(matches!(
            Config::load_or_default(&path, true),
            Err(ConfigError::Read { .. })
        ));
    }
}
