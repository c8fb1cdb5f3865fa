//! Supervisor state machine.
//!
//! ```text
//! STOPPED -> STARTING -> RUNNING -> RESTARTING -> STARTING ...
//!                           |            \-> FAILED (after max_consecutive_crashes)
//!                           \-> UPDATING -> STARTING (applied or rolled back)
//!                                     \-> FAILED (rollback failed)
//! ```
//!
//! Health checks, update checks and status reports run on independent
//! intervals. All process lifecycle operations go through [`ProcessHandle`].
//! A cycle whose state write fails is abandoned and picked up again on the
//! next health check; enough of those in a row raise one CRITICAL alert.

use chrono::{DateTime, FixedOffset, Utc};
use notify::{AlertKind, AlertRecord, DispatchHandle, Severity};
use pubwatch::{Config, Heartbeat, PersistenceError, QuietHours, StateStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SupervisionError};
use crate::git::{short, SourceControl};
use crate::process::{pid_alive, ProcessHandle};
use crate::state::{Phase, SupervisorState};

/// Feed id used for supervisor alerts.
pub const SUPERVISOR_FEED: &str = "supervisor";

/// Where the supervisor sends its alerts.
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: AlertRecord);
}

impl AlertSink for DispatchHandle {
    fn raise(&self, alert: AlertRecord) {
        if !self.enqueue(alert) {
            warn!("Dispatcher is gone, supervisor alert dropped");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timings {
    pub health_check: Duration,
    pub heartbeat_max_age: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_consecutive_crashes: u32,
    pub crash_reset_after: Duration,
    pub stop_timeout: Duration,
    /// `None` disables update checks.
    pub update_check: Option<Duration>,
    pub update_grace: Duration,
    pub update_probe_interval: Duration,
    pub update_probe_failures: u32,
    /// Consecutive failed state writes before a CRITICAL alert.
    pub persistence_alert_after: u32,
    /// `None` disables periodic status reports.
    pub status_report: Option<Duration>,
}

impl Timings {
    pub fn from_config(config: &Config) -> Self {
        let secs = Duration::from_secs;
        let supervisor = &config.supervisor;
        Self {
            health_check: secs(supervisor.health_check_interval_secs),
            heartbeat_max_age: secs(supervisor.heartbeat_max_age_secs),
            backoff_base: secs(supervisor.restart_backoff_base_secs),
            backoff_cap: secs(supervisor.restart_backoff_cap_secs),
            max_consecutive_crashes: supervisor.max_consecutive_crashes,
            crash_reset_after: secs(supervisor.crash_reset_after_secs),
            stop_timeout: secs(supervisor.stop_timeout_secs),
            update_check: supervisor
                .auto_update
                .then(|| secs(supervisor.update_check_interval_secs)),
            update_grace: secs(supervisor.update_grace_secs),
            update_probe_interval: secs(supervisor.update_probe_interval_secs),
            update_probe_failures: supervisor.update_probe_failures,
            persistence_alert_after: config.escalation.persistence_alert_after,
            status_report: (supervisor.status_report_interval_secs > 0)
                .then(|| secs(supervisor.status_report_interval_secs)),
        }
    }

    /// `min(base * 2^(crashes - 1), cap)`
    pub fn backoff(&self, crashes: u32) -> Duration {
        let exponent = crashes.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1 << exponent)
            .map_or(self.backoff_cap, |d| d.min(self.backoff_cap))
    }
}

/// How [`Supervisor::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Stopped,
    Failed,
}

pub struct Supervisor<P> {
    timings: Timings,
    process: P,
    store: Arc<StateStore<SupervisorState>>,
    alerts: Arc<dyn AlertSink>,
    source: Option<Arc<dyn SourceControl>>,
    heartbeat: Option<PathBuf>,
    quiet_hours: Option<(QuietHours, FixedOffset)>,
    supervising_since: Option<DateTime<Utc>>,
    started_at: Option<Instant>,
    started_wall: Option<DateTime<Utc>>,
    healthy_since: Option<Instant>,
    undelivered_seen: u64,
    write_failures: u32,
    write_alerted: bool,
}

impl<P: ProcessHandle> Supervisor<P> {
    pub fn new(
        timings: Timings,
        process: P,
        store: Arc<StateStore<SupervisorState>>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            timings,
            process,
            store,
            alerts,
            source: None,
            heartbeat: None,
            quiet_hours: None,
            supervising_since: None,
            started_at: None,
            started_wall: None,
            healthy_since: None,
            undelivered_seen: 0,
            write_failures: 0,
            write_alerted: false,
        }
    }

    /// Check this remote for updates.
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn SourceControl>) -> Self {
        self.source = Some(source);
        self
    }

    /// Require a fresh heartbeat at this path on every health check.
    #[must_use]
    pub fn with_heartbeat(mut self, path: PathBuf) -> Self {
        self.heartbeat = Some(path);
        self
    }

    /// Skip status reports inside this window, read at `offset`.
    #[must_use]
    pub fn with_quiet_hours(mut self, quiet_hours: QuietHours, offset: FixedOffset) -> Self {
        self.quiet_hours = Some((quiet_hours, offset));
        self
    }

    fn in_quiet_hours(&self, now: DateTime<Utc>) -> bool {
        self.quiet_hours
            .as_ref()
            .is_some_and(|(quiet, offset)| quiet.contains(now.with_timezone(offset).time()))
    }

    async fn phase(&self) -> Phase {
        self.store.snapshot().await.phase
    }

    /// Supervise until `cancel` fires or the pipeline cannot be kept alive.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<Exit> {
        let doc = self.store.snapshot().await;
        if doc.phase == Phase::Failed {
            error!(
                reason = doc.failed_reason.as_deref().unwrap_or("unknown"),
                "Supervisor is FAILED, run `pubwatch-supervisor reset` to start again"
            );
            return Ok(Exit::Failed);
        }
        if let Some(pid) = doc.pid.filter(|&pid| pid_alive(pid)) {
            warn!(pid, "A pipeline from a previous supervisor is still running");
        }

        let mut health = ticker(self.timings.health_check);
        let mut updates = self
            .timings
            .update_check
            .filter(|_| self.source.is_some())
            .map(ticker);
        let mut reports = self.timings.status_report.map(ticker);
        info!(
            health_check = ?self.timings.health_check,
            update_check = ?self.timings.update_check,
            status_report = ?self.timings.status_report,
            "Supervisor started"
        );
        self.supervising_since = Some(Utc::now());
        self.notice(
            Severity::Info,
            "pubwatch supervisor started".to_string(),
            self.schedule_lines().join("\n"),
        );

        let started = self.start_or_recover(Phase::Starting, &cancel).await;
        self.settle(started)?;

        loop {
            if self.phase().await == Phase::Failed {
                return Ok(Exit::Failed);
            }
            let cycle = tokio::select! {
                () = cancel.cancelled() => {
                    let stopped = self.shutdown().await;
                    self.notice(
                        Severity::Info,
                        "pubwatch supervisor stopped".to_string(),
                        match &stopped {
                            Ok(()) => "Pipeline stopped.".to_string(),
                            Err(e) => format!("Pipeline did not stop cleanly: {e}"),
                        },
                    );
                    return stopped.map(|()| Exit::Stopped);
                }
                _ = health.tick() => self.health_check(&cancel).await,
                () = next_tick(updates.as_mut()) => self.check_for_update(&cancel).await,
                () = next_tick(reports.as_mut()) => {
                    self.status_report().await;
                    Ok(())
                }
            };
            self.settle(cycle)?;
        }
    }

    /// Absorb a failed state write; anything else ends supervision.
    fn settle(&mut self, cycle: Result<()>) -> Result<()> {
        match cycle {
            Err(SupervisionError::Persistence(e)) => {
                self.persistence_failed(&e);
                Ok(())
            }
            other => other,
        }
    }

    fn persistence_failed(&mut self, e: &PersistenceError) {
        self.write_failures += 1;
        error!(
            error = %e,
            path = %self.store.path().display(),
            consecutive = self.write_failures,
            "Supervisor state write failed, retrying on the next check"
        );
        if self.write_failures >= self.timings.persistence_alert_after && !self.write_alerted {
            self.write_alerted = true;
            self.notice(
                Severity::Critical,
                "pubwatch supervisor cannot persist its state".to_string(),
                format!(
                    "{} consecutive state writes failed\nLast error: {e}",
                    self.write_failures
                ),
            );
        }
    }

    /// Mutate and persist the supervisor document.
    async fn save<R>(&mut self, f: impl FnOnce(&mut SupervisorState) -> R) -> Result<R> {
        let out = self.store.update(f).await?;
        if self.write_failures > 0 {
            info!(failed = self.write_failures, "Supervisor state writes recovered");
            self.write_failures = 0;
            self.write_alerted = false;
        }
        Ok(out)
    }

    async fn launch(&mut self, phase: Phase) -> Result<()> {
        self.save(|doc| doc.set_phase(phase)).await?;
        let pid = self.process.start().await?;

        self.started_at = Some(Instant::now());
        self.started_wall = Some(Utc::now());
        self.healthy_since = None;
        self.undelivered_seen = 0;
        self.save(|doc| {
            doc.pid = Some(pid);
            doc.last_restart_at = Some(Utc::now());
        })
            .await?;
        debug!(pid, phase = %phase, "Pipeline launched");
        Ok(())
    }

    async fn start_or_recover(&mut self, phase: Phase, cancel: &CancellationToken) -> Result<()> {
        match self.launch(phase).await {
            Ok(()) => Ok(()),
            Err(e @ SupervisionError::Persistence(_)) => Err(e),
            Err(e) => {
                warn!(error = %e, "Pipeline failed to start");
                self.recover(e.to_string(), cancel).await
            }
        }
    }

    async fn health_check(&mut self, cancel: &CancellationToken) -> Result<()> {
        let phase = self.phase().await;
        match phase {
            Phase::Starting | Phase::Running => {}
            // An earlier cycle stopped before it could record a relaunch.
            Phase::Stopped | Phase::Restarting | Phase::Updating if !self.process.is_alive() => {
                return self.resume(cancel).await;
            }
            _ => return Ok(()),
        }

        match self.probe().await {
            Ok(()) => self.healthy(phase).await,
            Err(e) => {
                warn!(phase = %phase, error = %e, "Pipeline failed its health check");
                if let Err(e) = self.process.stop(self.timings.stop_timeout).await {
                    warn!(error = %e, "Failed to stop unhealthy pipeline");
                }
                self.recover(e.to_string(), cancel).await
            }
        }
    }

    async fn resume(&mut self, cancel: &CancellationToken) -> Result<()> {
        let crashes = self.store.snapshot().await.consecutive_crash_count;
        if crashes >= self.timings.max_consecutive_crashes {
            return self
                .enter_failed(format!("{crashes} consecutive crashes"))
                .await;
        }
        info!(crashes, "Resuming an interrupted relaunch");
        self.start_or_recover(Phase::Starting, cancel).await
    }

    /// Liveness plus heartbeat freshness.
    async fn probe(&mut self) -> Result<()> {
        if !self.process.is_alive() {
            let code = tokio::time::timeout(Duration::from_secs(1), self.process.wait()).await;
            return Err(SupervisionError::Probe(match code {
                Ok(Ok(Some(code))) => format!("pipeline exited with code {code}"),
                _ => "pipeline is not running".to_string(),
            }));
        }

        let Some(path) = &self.heartbeat else {
            return Ok(());
        };
        let started = self.started_wall;
        let beat = match Heartbeat::read(path).await {
            Ok(beat) => beat.filter(|b| started.is_none_or(|s| b.beat_at >= s)),
            Err(e) => {
                warn!(error = %e, "Could not read heartbeat");
                None
            }
        };

        match beat {
            Some(beat) => {
                self.note_undelivered(beat.undelivered_alerts);
                let now = Utc::now();
                if !beat.is_fresh(now, self.timings.heartbeat_max_age) {
                    return Err(SupervisionError::Probe(format!(
                        "heartbeat is {}s old",
                        (now - beat.beat_at).num_seconds()
                    )));
                }
                Ok(())
            }
            None if self
                .started_at
                .is_some_and(|at| at.elapsed() > self.timings.heartbeat_max_age) =>
            {
                Err(SupervisionError::Probe("no heartbeat since start".to_string()))
            }
            None => Ok(()),
        }
    }

    fn note_undelivered(&mut self, count: u64) {
        if count > self.undelivered_seen {
            warn!(
                undelivered = count,
                new = count - self.undelivered_seen,
                "Pipeline has alerts it could not deliver"
            );
        }
        self.undelivered_seen = count;
    }

    async fn healthy(&mut self, phase: Phase) -> Result<()> {
        let now = Instant::now();
        let since = *self.healthy_since.get_or_insert(now);
        let settled = now.duration_since(since) >= self.timings.crash_reset_after;
        let crashes = self.store.snapshot().await.consecutive_crash_count;

        if phase == Phase::Starting {
            info!(pid = ?self.process.pid(), "Pipeline is running");
        }
        if phase == Phase::Starting || (settled && crashes > 0) {
            self.save(|doc| {
                doc.set_phase(Phase::Running);
                if settled && doc.consecutive_crash_count > 0 {
                    info!(crashes = doc.consecutive_crash_count, "Pipeline stable, crash count reset");
                    doc.consecutive_crash_count = 0;
                }
            })
            .await?;
        }
        Ok(())
    }

    /// Count a crash, then restart after the backoff or give up.
    async fn recover(&mut self, mut reason: String, cancel: &CancellationToken) -> Result<()> {
        loop {
            self.healthy_since = None;
            let crashes = self
                .save(|doc| {
                    doc.consecutive_crash_count += 1;
                    doc.pid = None;
                    doc.set_phase(Phase::Restarting);
                    doc.consecutive_crash_count
                })
                .await?;

            if crashes >= self.timings.max_consecutive_crashes {
                return self
                    .enter_failed(format!("{crashes} consecutive crashes, last: {reason}"))
                    .await;
            }

            let delay = self.timings.backoff(crashes);
            warn!(crashes, ?delay, reason = %reason, "Restarting pipeline");
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = sleep(delay) => {}
            }

            match self.launch(Phase::Starting).await {
                Ok(()) => {
                    self.notice(
                        Severity::Info,
                        "pubwatch pipeline restarted".to_string(),
                        format!("Restart after {crashes} consecutive crash(es), last: {reason}"),
                    );
                    return Ok(());
                }
                Err(e @ SupervisionError::Persistence(_)) => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Pipeline failed to start");
                    self.notice(
                        Severity::Warning,
                        "pubwatch pipeline restart failed".to_string(),
                        e.to_string(),
                    );
                    reason = e.to_string();
                }
            }
        }
    }

    async fn enter_failed(&mut self, reason: String) -> Result<()> {
        error!(reason = %reason, "Giving up on the pipeline");
        if let Err(e) = self.process.stop(self.timings.stop_timeout).await {
            warn!(error = %e, "Failed to stop pipeline");
        }
        let body = format!("{reason}. Run `pubwatch-supervisor reset` to start it again.");
        self.save(|doc| {
            doc.set_phase(Phase::Failed);
            doc.pid = None;
            doc.failed_reason = Some(reason);
        })
            .await?;
        self.notice(
            Severity::Critical,
            "pubwatch supervisor gave up".to_string(),
            body,
        );
        Ok(())
    }

    async fn check_for_update(&mut self, cancel: &CancellationToken) -> Result<()> {
        let Some(source) = self.source.clone() else {
            return Ok(());
        };
        if self.phase().await != Phase::Running {
            debug!("Pipeline not running, skipping update check");
            return Ok(());
        }

        let found = source.check_update().await;
        self.save(|doc| doc.last_remote_check_at = Some(Utc::now())).await?;
        let target = match found {
            Ok(Some(target)) => target,
            Ok(None) => {
                debug!("No update available");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "Update check failed");
                return Ok(());
            }
        };

        if self.store.snapshot().await.rejected_revision.as_deref() == Some(target.as_str()) {
            debug!(revision = short(&target), "Remote is still at a rolled back revision");
            return Ok(());
        }
        let current = match source.current_revision().await {
            Ok(current) => current,
            Err(e) => {
                warn!(error = %e, "Could not read current revision, skipping update");
                return Ok(());
            }
        };

        info!(from = short(&current), to = short(&target), "Applying update");
        self.save(|doc| {
            doc.set_phase(Phase::Updating);
            doc.rollback_point = Some(current.clone());
        })
            .await?;
        if let Err(e) = self.process.stop(self.timings.stop_timeout).await {
            warn!(error = %e, "Failed to stop pipeline for update");
        }

        if let Err(e) = source.apply(&target).await {
            warn!(error = %e, "Could not apply update");
            self.notice(
                Severity::Warning,
                format!("pubwatch update to {} failed", short(&target)),
                e.to_string(),
            );
            return self.restore(source.as_ref(), &current, cancel).await;
        }
        self.save(|doc| doc.last_applied_revision = Some(target.clone())).await?;
        if let Err(e) = self.launch(Phase::Updating).await {
            if matches!(e, SupervisionError::Persistence(_)) {
                return Err(e);
            }
            warn!(error = %e, "Updated pipeline failed to start");
        }

        let deadline = Instant::now() + self.timings.update_grace;
        let mut failures = 0;
        while Instant::now() < deadline {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = sleep(self.timings.update_probe_interval) => {}
            }
            if let Err(e) = self.probe().await {
                failures += 1;
                warn!(failures, error = %e, "Updated pipeline failed a probe");
                if failures >= self.timings.update_probe_failures {
                    return self.roll_back(source.as_ref(), &target, &current, cancel).await;
                }
            }
        }

        info!(revision = short(&target), "Update is healthy");
        self.healthy_since = Some(Instant::now());
        self.save(|doc| {
            doc.set_phase(Phase::Running);
            doc.rollback_point = None;
        })
            .await?;
        self.notice(
            Severity::Info,
            format!("pubwatch updated to {}", short(&target)),
            format!("Previous revision {}.", short(&current)),
        );
        Ok(())
    }

    async fn roll_back(
        &mut self,
        source: &dyn SourceControl,
        rejected: &str,
        previous: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        warn!(rejected = short(rejected), to = short(previous), "Rolling back update");
        if let Err(e) = self.process.stop(self.timings.stop_timeout).await {
            warn!(error = %e, "Failed to stop pipeline for rollback");
        }
        self.save(|doc| doc.rejected_revision = Some(rejected.to_string())).await?;
        self.notice(
            Severity::Warning,
            format!("pubwatch update {} rolled back", short(rejected)),
            format!(
                "The new revision failed {} health probes, returning to {}.",
                self.timings.update_probe_failures,
                short(previous)
            ),
        );
        self.restore(source, previous, cancel).await
    }

    /// Check out `revision` again and start the pipeline on it.
    async fn restore(
        &mut self,
        source: &dyn SourceControl,
        revision: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let Err(e) = source.apply(revision).await {
            return self
                .enter_failed(format!("could not restore revision {}: {e}", short(revision)))
                .await;
        }
        self.save(|doc| {
            doc.last_applied_revision = Some(revision.to_string());
            doc.rollback_point = None;
        })
            .await?;
        self.start_or_recover(Phase::Starting, cancel).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        info!("Stopping pipeline");
        let stopped = self.process.stop(self.timings.stop_timeout).await;
        self.save(|doc| {
            doc.pid = None;
            if doc.phase != Phase::Failed {
                doc.set_phase(Phase::Stopped);
            }
        })
        .await?;
        stopped
    }

    fn schedule_lines(&self) -> Vec<String> {
        let every = |d: Option<Duration>| match d {
            Some(d) => format!("every {}s", d.as_secs()),
            None => "off".to_string(),
        };
        vec![
            format!("Health check: {}", every(Some(self.timings.health_check))),
            format!(
                "Update check: {}",
                every(self.timings.update_check.filter(|_| self.source.is_some()))
            ),
            format!("Status report: {}", every(self.timings.status_report)),
        ]
    }

    /// Periodic INFO notice with the pipeline's phase and uptime.
    async fn status_report(&self) {
        let now = Utc::now();
        if self.in_quiet_hours(now) {
            debug!("Quiet hours, status report skipped");
            return;
        }
        let doc = self.store.snapshot().await;
        let mut lines = vec![format!("Phase: {}", doc.phase)];
        if let Some(since) = self.supervising_since {
            let uptime = now - since;
            lines.push(format!(
                "Supervising since {} ({}h {}m)",
                since.format("%Y-%m-%d %H:%M UTC"),
                uptime.num_hours(),
                uptime.num_minutes() % 60
            ));
        }
        lines.push(match doc.pid {
            Some(pid) => format!("Pipeline pid: {pid}"),
            None => "Pipeline pid: none".to_string(),
        });
        lines.push(format!("Consecutive crashes: {}", doc.consecutive_crash_count));
        if let Some(at) = doc.last_restart_at {
            lines.push(format!("Last launch: {}", at.format("%Y-%m-%d %H:%M UTC")));
        }
        if let Some(revision) = &doc.last_applied_revision {
            lines.push(format!("Revision: {}", short(revision)));
        }
        self.notice(
            Severity::Info,
            "pubwatch supervisor status".to_string(),
            lines.join("\n"),
        );
    }

    fn notice(&self, tier: Severity, title: String, body: String) {
        self.alerts.raise(AlertRecord::new(
            SUPERVISOR_FEED,
            tier,
            AlertKind::System,
            title,
            body,
            Utc::now(),
        ));
    }
}

fn ticker(every: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + every, every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn next_tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
