//! Monitoring pipeline: poll -> classify -> escalate -> dispatch.
//!
//! [`Monitor`] holds the per-cycle logic and is driven directly in tests.
//! [`Pipeline`] owns the schedulers: one task per feed, a quiet-hours flusher,
//! the daily summary, the heartbeat writer and the archive for undeliverable
//! alerts.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use notify::{
    AlertKind, AlertRecord, DispatchHandle, DispatchWorker, Dispatcher, NotifyChannel, Severity,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classifier::{Classifier, PublicationState};
use crate::config::Config;
use crate::error::PersistenceError;
use crate::escalation::Escalator;
use crate::feed::FeedDefinition;
use crate::heartbeat::Heartbeat;
use crate::poller::{FeedSource, Poller};
use crate::snapshot::FeedSnapshot;
use crate::store::{FeedRecord, MonitorState, StateStore};

/// How often the quiet-hours queue is checked for flushing.
const QUIET_HOURS_CHECK: Duration = Duration::from_secs(30);

const DAILY_SUMMARY_CHECK: Duration = Duration::from_secs(30);

/// Feed id used for alerts about the pipeline itself.
pub const SYSTEM_FEED: &str = "pubwatch";

/// Result of one classify/escalate cycle.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub state: PublicationState,
    pub alert: Option<AlertRecord>,
}

/// Per-cycle logic over the monitor document.
pub struct Monitor {
    store: Arc<StateStore<MonitorState>>,
    classifier: Classifier,
    escalator: Escalator,
    daily_summary_at: Option<NaiveTime>,
}

impl Monitor {
    pub fn new(config: &Config, store: Arc<StateStore<MonitorState>>) -> Self {
        Self {
            store,
            classifier: Classifier::new(config.calendar.clone(), config.api.transport_error_threshold),
            escalator: Escalator::new(
                Duration::from_secs(config.escalation.cooldown_seconds),
                config.escalation.quiet_hours.clone(),
                &config.calendar,
            ),
            daily_summary_at: config.escalation.daily_summary.as_ref().map(|d| d.at),
        }
    }

    pub fn store(&self) -> &StateStore<MonitorState> {
        &self.store
    }

    /// Classify `snapshot`, run escalation, and persist, all under the store lock.
    pub async fn process(
        &self,
        feed: &FeedDefinition,
        snapshot: FeedSnapshot,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, PersistenceError> {
        let classifier = &self.classifier;
        let escalator = &self.escalator;

        self.store
            .update(|doc| {
                let record = doc.record_mut(&feed.id);
                let (today, _) = feed.local(classifier.calendar(), now);
                let mut state = classifier.classify(
                    feed,
                    &snapshot,
                    &record.state,
                    record.latest.as_ref(),
                    record.comparison_base(today),
                    now,
                );

                if state.classification != record.state.classification {
                    info!(
                        feed = %feed.id,
                        classification = %state.classification,
                        previous = %record.state.classification,
                        delay_minutes = state.delay_minutes,
                        "Feed classification changed"
                    );
                }

                let content_hash = snapshot
                    .content_hash
                    .clone()
                    .or_else(|| record.latest.as_ref().and_then(|s| s.content_hash.clone()));
                let alert = escalator.evaluate(
                    feed,
                    &mut state,
                    content_hash.as_deref(),
                    now,
                    &mut doc.quiet_queue,
                );

                let record = doc.record_mut(&feed.id);
                record.state = state.clone();
                record.retain(snapshot, today);
                doc.updated_at = Some(now);

                CycleOutcome { state, alert }
            })
            .await
    }

    /// Classify without persisting or escalating.
    pub async fn check(
        &self,
        feed: &FeedDefinition,
        snapshot: &FeedSnapshot,
        now: DateTime<Utc>,
    ) -> PublicationState {
        let doc = self.store.snapshot().await;
        let record = doc
            .feeds
            .get(&feed.id)
            .cloned()
            .unwrap_or_else(|| FeedRecord::new(&feed.id));
        let (today, _) = feed.local(self.classifier.calendar(), now);

        self.classifier.classify(
            feed,
            snapshot,
            &record.state,
            record.latest.as_ref(),
            record.comparison_base(today),
            now,
        )
    }

    /// Summary of the alerts held during quiet hours, once they are over.
    pub async fn flush_quiet_hours(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertRecord>, PersistenceError> {
        if self.escalator.in_quiet_hours(now) || self.store.snapshot().await.quiet_queue.is_empty() {
            return Ok(None);
        }
        let escalator = &self.escalator;
        self.store
            .update(|doc| escalator.flush_quiet_hours(&mut doc.quiet_queue, now))
            .await
    }

    /// The day's INFO digest of `feeds`, once per calendar day after the
    /// configured time.
    pub async fn daily_summary(
        &self,
        feeds: &[FeedDefinition],
        now: DateTime<Utc>,
    ) -> Result<Option<AlertRecord>, PersistenceError> {
        let Some(at) = self.daily_summary_at else {
            return Ok(None);
        };
        let calendar = self.classifier.calendar();
        let local = now.with_timezone(&calendar.offset());
        let today = local.date_naive();
        if local.time() < at {
            return Ok(None);
        }

        let doc = self.store.snapshot().await;
        if doc.last_daily_summary == Some(today) {
            return Ok(None);
        }

        let mut due = 0;
        let mut published = 0;
        let mut lines = Vec::with_capacity(feeds.len());
        for feed in feeds {
            let (day, _) = feed.local(calendar, now);
            if !feed.publishes_on(calendar, day) {
                lines.push(format!("{}: not a publication day", feed.display_name));
                continue;
            }
            due += 1;
            let record = doc.feeds.get(&feed.id);
            if record.is_some_and(|r| r.state.classification.is_published() && r.state.day == Some(day)) {
                published += 1;
            }
            lines.push(summary_line(feed, record, day));
        }

        self.store
            .update(|doc| doc.last_daily_summary = Some(today))
            .await?;
        info!(date = %today, published, due, "Daily summary ready");

        let mut body = format!("{published} of {due} feeds published today");
        for line in lines {
            body.push('\n');
            body.push_str(&line);
        }
        Ok(Some(AlertRecord::new(
            SYSTEM_FEED,
            Severity::Info,
            AlertKind::DailySummary,
            format!("pubwatch daily summary {today}"),
            body,
            now,
        )))
    }

    pub async fn archive_undelivered(&self, alert: AlertRecord) -> Result<(), PersistenceError> {
        self.store.update(|doc| doc.archive_undelivered(alert)).await
    }

    /// Alerts left undelivered by the previous run.
    pub async fn take_pending_alerts(&self) -> Result<Vec<AlertRecord>, PersistenceError> {
        if self.store.snapshot().await.pending_alerts.is_empty() {
            return Ok(Vec::new());
        }
        self.store
            .update(|doc| std::mem::take(&mut doc.pending_alerts))
            .await
    }

    pub async fn save_pending_alerts(&self, alerts: Vec<AlertRecord>) -> Result<(), PersistenceError> {
        self.store
            .update(|doc| doc.pending_alerts.extend(alerts))
            .await
    }
}

fn summary_line(feed: &FeedDefinition, record: Option<&FeedRecord>, day: NaiveDate) -> String {
    let Some(record) = record.filter(|r| r.state.day == Some(day)) else {
        return format!("{}: no observation today", feed.display_name);
    };
    let state = &record.state;
    let mut line = format!("{}: {}", feed.display_name, state.classification);
    if let Some(time) = state.published_time {
        line.push_str(&format!(" at {}", time.format("%H:%M")));
    }
    if let Some(publication) = record.latest.as_ref().and_then(|s| s.publication.as_ref()) {
        if publication.date == day && !publication.title.is_empty() {
            line.push_str(&format!(" \"{}\"", publication.title));
        }
    }
    if let Some(delta) = &state.comparison {
        line.push_str(&format!(", {}", delta.describe()));
    }
    line
}

#[derive(Default)]
struct Stats {
    cycles: AtomicU64,
    undelivered: AtomicU64,
    persistence_failures: AtomicU32,
    persistence_alerted: AtomicBool,
}

/// Shared state of the running schedulers.
struct Runtime {
    monitor: Monitor,
    poller: Poller,
    semaphore: Arc<Semaphore>,
    dispatch: DispatchHandle,
    stats: Stats,
    persistence_alert_after: u32,
}

impl Runtime {
    async fn run_feed(self: Arc<Self>, feed: FeedDefinition, cancel: CancellationToken) {
        let mut ticker = interval(Duration::from_secs(feed.poll_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(feed = %feed.id, interval_secs = feed.poll_interval_secs, "Feed scheduler started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let permit = tokio::select! {
                () = cancel.cancelled() => break,
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let snapshot = self.poller.poll(&feed).await;
            drop(permit);

            match self.monitor.process(&feed, snapshot, Utc::now()).await {
                Ok(outcome) => {
                    self.stats.cycles.fetch_add(1, Ordering::Relaxed);
                    self.persistence_ok();
                    if let Some(alert) = outcome.alert {
                        self.dispatch.enqueue(alert);
                    }
                }
                Err(e) => self.persistence_failed(&e),
            }
        }
        debug!(feed = %feed.id, "Feed scheduler stopped");
    }

    async fn run_quiet_hours(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(QUIET_HOURS_CHECK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.monitor.flush_quiet_hours(Utc::now()).await {
                Ok(Some(summary)) => {
                    self.dispatch.enqueue(summary);
                }
                Ok(None) => {}
                Err(e) => self.persistence_failed(&e),
            }
        }
    }

    async fn run_daily_summary(self: Arc<Self>, feeds: Vec<FeedDefinition>, cancel: CancellationToken) {
        let mut ticker = interval(DAILY_SUMMARY_CHECK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.monitor.daily_summary(&feeds, Utc::now()).await {
                Ok(Some(summary)) => {
                    self.dispatch.enqueue(summary);
                }
                Ok(None) => {}
                Err(e) => self.persistence_failed(&e),
            }
        }
    }

    async fn run_heartbeat(
        self: Arc<Self>,
        path: std::path::PathBuf,
        every: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let beat = Heartbeat::now(
                self.stats.cycles.load(Ordering::Relaxed),
                self.stats.undelivered.load(Ordering::Relaxed),
            );
            if let Err(e) = beat.write(&path).await {
                warn!(error = %e, "Failed to write heartbeat");
            }
        }
    }

    /// Runs until the dispatcher drops its sender, so records exhausted
    /// during the shutdown drain are archived too.
    async fn run_undelivered(self: Arc<Self>, mut exhausted: mpsc::UnboundedReceiver<AlertRecord>) {
        while let Some(alert) = exhausted.recv().await {
            self.stats.undelivered.fetch_add(1, Ordering::Relaxed);
            warn!(
                feed = %alert.feed_id,
                tier = %alert.tier,
                attempts = alert.attempts,
                "Alert undeliverable, archived"
            );
            if let Err(e) = self.monitor.archive_undelivered(alert).await {
                self.persistence_failed(&e);
            }
        }
    }

    fn persistence_ok(&self) {
        if self.stats.persistence_failures.swap(0, Ordering::Relaxed) > 0 {
            info!("State writes recovered");
            self.stats.persistence_alerted.store(false, Ordering::Relaxed);
        }
    }

    fn persistence_failed(&self, e: &PersistenceError) {
        let failures = self.stats.persistence_failures.fetch_add(1, Ordering::Relaxed) + 1;
        error!(error = %e, consecutive = failures, "State write failed, cycle will be retried");

        if failures >= self.persistence_alert_after
            && !self.stats.persistence_alerted.swap(true, Ordering::Relaxed)
        {
            self.dispatch.enqueue(AlertRecord::new(
                SYSTEM_FEED,
                Severity::Critical,
                AlertKind::System,
                "pubwatch cannot persist its state",
                format!("{failures} consecutive state writes failed\nLast error: {e}"),
                Utc::now(),
            ));
        }
    }
}

/// The long-running monitor.
pub struct Pipeline {
    config: Arc<Config>,
    monitor: Monitor,
    poller: Poller,
    channel: Arc<dyn NotifyChannel>,
}

impl Pipeline {
    pub fn new(
        config: Arc<Config>,
        store: Arc<StateStore<MonitorState>>,
        source: Arc<dyn FeedSource>,
        channel: Arc<dyn NotifyChannel>,
    ) -> Self {
        let monitor = Monitor::new(&config, store);
        let poller = Poller::new(source, Duration::from_secs(config.api.timeout_secs));
        Self {
            config,
            monitor,
            poller,
            channel,
        }
    }

    /// Run until `cancel` fires, then drain and flush.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), PersistenceError> {
        let config = self.config;
        // Stopped only after the schedulers, so their last alerts still go out.
        let stop_dispatch = CancellationToken::new();
        let DispatchWorker {
            handle,
            exhausted,
            join,
        } = Dispatcher::new(self.channel, config.webhook.retry_policy()).spawn(
            stop_dispatch.clone(),
            Duration::from_secs(config.webhook.drain_timeout_secs),
        );

        match self.monitor.take_pending_alerts().await {
            Ok(carried) if !carried.is_empty() => {
                info!(count = carried.len(), "Re-queuing alerts from the previous run");
                for alert in carried {
                    handle.enqueue(alert);
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not take over pending alerts"),
        }

        let runtime = Arc::new(Runtime {
            monitor: self.monitor,
            poller: self.poller,
            semaphore: Arc::new(Semaphore::new(config.api.max_concurrent_polls)),
            dispatch: handle,
            stats: Stats::default(),
            persistence_alert_after: config.escalation.persistence_alert_after,
        });

        let mut tasks = JoinSet::new();
        for feed in &config.feeds {
            tasks.spawn(Arc::clone(&runtime).run_feed(feed.clone(), cancel.clone()));
        }
        tasks.spawn(Arc::clone(&runtime).run_quiet_hours(cancel.clone()));
        if config.escalation.daily_summary.is_some() {
            tasks.spawn(Arc::clone(&runtime).run_daily_summary(config.feeds.clone(), cancel.clone()));
        }
        tasks.spawn(Arc::clone(&runtime).run_heartbeat(
            config.state.heartbeat_path.clone(),
            Duration::from_secs(config.state.heartbeat_interval_secs),
            cancel.clone(),
        ));
        let archiver = tokio::spawn(Arc::clone(&runtime).run_undelivered(exhausted));

        info!(
            feeds = config.feeds.len(),
            max_concurrent_polls = config.api.max_concurrent_polls,
            "Pipeline started"
        );

        cancel.cancelled().await;
        info!("Shutdown requested, waiting for in-flight polls");

        let shutdown_timeout = Duration::from_secs(config.state.shutdown_timeout_secs);
        let drained = tokio::time::timeout(shutdown_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("In-flight polls did not finish in time, aborting them");
            tasks.abort_all();
        }

        stop_dispatch.cancel();
        let pending = join.await.unwrap_or_else(|e| {
            error!(error = %e, "Dispatcher task failed");
            Vec::new()
        });
        if let Err(e) = archiver.await {
            error!(error = %e, "Undelivered-alert archiver failed");
        }

        if !pending.is_empty() {
            info!(count = pending.len(), "Saving undelivered alerts for the next run");
            runtime.monitor.save_pending_alerts(pending).await?;
        }
        runtime.monitor.store().flush().await?;
        info!("Pipeline stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::tests::{feed, kst, published, t};
    use crate::classifier::Classification;
    use tempfile::TempDir;

    async fn monitor(dir: &TempDir) -> Monitor {
        let mut config = Config::default();
        config.escalation.quiet_hours = None;
        let store = Arc::new(
            StateStore::open(dir.path().join("state.json"))
                .await
                .unwrap(),
        );
        Monitor::new(&config, store)
    }

    #[tokio::test]
    async fn test_on_time_produces_no_alert() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(&dir).await;

        let outcome = monitor
            .process(&feed(), published(12, 15, 38, kst(12, 15, 39)), kst(12, 15, 39))
            .await
            .unwrap();
        assert_eq!(outcome.state.classification, Classification::OnTime);
        assert!(outcome.alert.is_none());
    }

    #[tokio::test]
    async fn test_delayed_produces_exactly_one_warning() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(&dir).await;
        let feed = feed();

        let mut alerts = Vec::new();
        for minute in [6, 7, 30, 50] {
            let now = kst(12, 16, minute);
            let outcome = monitor
                .process(&feed, published(12, 16, 5, now), now)
                .await
                .unwrap();
            assert_eq!(outcome.state.classification, Classification::Delayed);
            alerts.extend(outcome.alert);
        }

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].tier, Severity::Warning);
    }

    #[tokio::test]
    async fn test_missing_produces_one_critical_and_persists() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(&dir).await;
        let feed = feed();

        let mut alerts = Vec::new();
        for minute in [45, 51, 52] {
            let now = kst(12, 15, minute);
            let outcome = monitor
                .process(&feed, published(11, 15, 38, now), now)
                .await
                .unwrap();
            alerts.extend(outcome.alert);
        }
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].tier, Severity::Critical);

        let reopened: StateStore<MonitorState> =
            StateStore::open(dir.path().join("state.json")).await.unwrap();
        let doc = reopened.snapshot().await;
        let record = &doc.feeds["kospi-close"];
        assert_eq!(record.state.classification, Classification::Missing);
        assert_eq!(record.state.last_alerted_tier, Some(Severity::Critical));
    }

    #[tokio::test]
    async fn test_malformed_poll_does_not_hide_stale_content() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(&dir).await;
        let mut feed = feed();
        feed.stale_after_mins = Some(30);

        let first = monitor
            .process(&feed, published(12, 15, 38, kst(12, 15, 38)), kst(12, 15, 38))
            .await
            .unwrap();
        assert_eq!(first.state.classification, Classification::OnTime);

        let garbage = FeedSnapshot::from_body("kospi-close", kst(12, 16, 0), "<html>502</html>");
        let broken = monitor.process(&feed, garbage, kst(12, 16, 0)).await.unwrap();
        assert_eq!(broken.state.classification, Classification::Unknown);

        let again = monitor
            .process(&feed, published(12, 15, 38, kst(12, 16, 10)), kst(12, 16, 10))
            .await
            .unwrap();
        assert_eq!(again.state.classification, Classification::Stale);
        assert_eq!(again.state.content_changed_at, Some(kst(12, 15, 38)));
    }

    #[tokio::test]
    async fn test_daily_summary_once_per_day() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(&dir).await;
        let feeds = vec![
            feed(),
            FeedDefinition::new(
                "exchange-rate",
                "Exchange rate close",
                "/exchange-rate",
                t(16, 25),
                t(16, 35),
            ),
        ];
        monitor
            .process(&feeds[0], published(12, 15, 38, kst(12, 15, 38)), kst(12, 15, 38))
            .await
            .unwrap();

        assert!(monitor.daily_summary(&feeds, kst(12, 17, 59)).await.unwrap().is_none());

        let summary = monitor
            .daily_summary(&feeds, kst(12, 18, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.kind, AlertKind::DailySummary);
        assert_eq!(summary.tier, Severity::Info);
        assert_eq!(summary.title, "pubwatch daily summary 2025-08-12");
        assert!(summary.body.starts_with("1 of 2 feeds published today"), "{}", summary.body);
        assert!(summary.body.contains("KOSPI close: ON_TIME at 15:38 \"KOSPI close\""));
        assert!(summary.body.contains("Exchange rate close: no observation today"));
        assert_eq!(
            monitor.store().snapshot().await.last_daily_summary,
            NaiveDate::from_ymd_opt(2025, 8, 12)
        );

        assert!(monitor.daily_summary(&feeds, kst(12, 18, 30)).await.unwrap().is_none());

        // Saturday: nothing is due, the summary still goes out.
        let weekend = monitor
            .daily_summary(&feeds, kst(16, 18, 5))
            .await
            .unwrap()
            .unwrap();
        assert!(weekend.body.starts_with("0 of 0 feeds published today"));
        assert!(weekend.body.contains("KOSPI close: not a publication day"));
    }

    #[tokio::test]
    async fn test_check_does_not_persist() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(&dir).await;

        let state = monitor
            .check(&feed(), &published(12, 16, 5, kst(12, 16, 6)), kst(12, 16, 6))
            .await;
        assert_eq!(state.classification, Classification::Delayed);
        assert!(monitor.store().snapshot().await.feeds.is_empty());
        assert!(!dir.path().join("state.json").exists());
    }

    #[tokio::test]
    async fn test_pending_alerts_are_taken_once() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(&dir).await;
        let alert = AlertRecord::new(
            "kospi-close",
            Severity::Warning,
            AlertKind::Escalation,
            "late",
            "",
            Utc::now(),
        );

        monitor.save_pending_alerts(vec![alert.clone()]).await.unwrap();
        assert_eq!(monitor.take_pending_alerts().await.unwrap(), vec![alert]);
        assert!(monitor.take_pending_alerts().await.unwrap().is_empty());
    }
}
