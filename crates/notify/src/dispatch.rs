//! Retrying dispatcher.
//!
//! The dispatcher owns a retry queue on a background task. Producers hand
//! records over through [`DispatchHandle::enqueue`], which never blocks, so a
//! slow or unreachable webhook can never stall the polling path.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alert::{AlertRecord, DispatchStatus};
use crate::NotifyChannel;

/// Exponential backoff for failed deliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            multiplier: 2.0,
            cap: Duration::from_secs(300),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `attempt` failed attempts.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        let cap = self.cap.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            self.cap
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    Sent,
    RetryScheduled { attempt: u32, retry_in: Duration },
    FailedPermanently { attempts: u32 },
}

/// Formats alert records and pushes them through a channel.
pub struct Dispatcher {
    channel: Arc<dyn NotifyChannel>,
    policy: RetryPolicy,
}

impl Dispatcher {
    #[must_use]
    pub fn new(channel: Arc<dyn NotifyChannel>, policy: RetryPolicy) -> Self {
        Self { channel, policy }
    }

    /// Make one delivery attempt and update the record accordingly.
    pub async fn send(&self, alert: &mut AlertRecord) -> DispatchResult {
        alert.attempts += 1;
        let message = alert.to_message();

        match self.channel.send(&message).await {
            Ok(()) => {
                alert.status = DispatchStatus::Sent;
                alert.next_retry_at = None;
                alert.last_error = None;
                info!(
                    channel = self.channel.name(),
                    feed = %alert.feed_id,
                    tier = %alert.tier,
                    attempt = alert.attempts,
                    "Alert delivered"
                );
                DispatchResult::Sent
            }
            Err(e) => {
                alert.last_error = Some(e.to_string());

                if alert.attempts >= self.policy.max_attempts {
                    alert.status = DispatchStatus::Failed;
                    alert.next_retry_at = None;
                    error!(
                        channel = self.channel.name(),
                        feed = %alert.feed_id,
                        attempts = alert.attempts,
                        error = %e,
                        "Alert delivery failed permanently"
                    );
                    return DispatchResult::FailedPermanently {
                        attempts: alert.attempts,
                    };
                }

                let mut retry_in = self.policy.delay_for(alert.attempts);
                if let Some(secs) = e.retry_after_secs() {
                    retry_in = retry_in.max(Duration::from_secs(secs));
                }
                alert.status = DispatchStatus::Pending;
                alert.next_retry_at = chrono::Duration::from_std(retry_in)
                    .ok()
                    .map(|d| Utc::now() + d);

                warn!(
                    channel = self.channel.name(),
                    feed = %alert.feed_id,
                    attempt = alert.attempts,
                    retry_in_ms = u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Alert delivery failed, retry scheduled"
                );
                DispatchResult::RetryScheduled {
                    attempt: alert.attempts,
                    retry_in,
                }
            }
        }
    }

    /// Move the dispatcher onto a background task.
    ///
    /// On cancellation the worker keeps delivering for at most
    /// `drain_timeout`, then returns the records it could not deliver.
    #[must_use]
    pub fn spawn(self, cancel: CancellationToken, drain_timeout: Duration) -> DispatchWorker {
        let (tx, rx) = mpsc::unbounded_channel();
        let (exhausted_tx, exhausted_rx) = mpsc::unbounded_channel();

        let join = tokio::spawn(self.run(rx, exhausted_tx, cancel, drain_timeout));

        DispatchWorker {
            handle: DispatchHandle { tx },
            exhausted: exhausted_rx,
            join,
        }
    }

    async fn run(
        self,
        mut inbox: mpsc::UnboundedReceiver<AlertRecord>,
        exhausted: mpsc::UnboundedSender<AlertRecord>,
        cancel: CancellationToken,
        drain_timeout: Duration,
    ) -> Vec<AlertRecord> {
        let mut queue: Vec<(Instant, AlertRecord)> = Vec::new();

        loop {
            let next_due = queue.iter().map(|(at, _)| *at).min();

            tokio::select! {
                () = cancel.cancelled() => break,
                received = inbox.recv() => match received {
                    Some(alert) => {
                        debug!(feed = %alert.feed_id, tier = %alert.tier, "Alert queued");
                        queue.push((Instant::now(), alert));
                    }
                    None => break,
                },
                () = sleep_until_due(next_due) => {
                    self.process_due(&mut queue, &exhausted).await;
                }
            }
        }

        while let Ok(alert) = inbox.try_recv() {
            queue.push((Instant::now(), alert));
        }

        self.drain(queue, &exhausted, Instant::now() + drain_timeout)
            .await
    }

    async fn process_due(
        &self,
        queue: &mut Vec<(Instant, AlertRecord)>,
        exhausted: &mpsc::UnboundedSender<AlertRecord>,
    ) {
        let now = Instant::now();
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(queue)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        *queue = later;

        for (_, mut alert) in due {
            match self.send(&mut alert).await {
                DispatchResult::Sent => {}
                DispatchResult::RetryScheduled { retry_in, .. } => {
                    queue.push((Instant::now() + retry_in, alert));
                }
                DispatchResult::FailedPermanently { .. } => {
                    let _ = exhausted.send(alert);
                }
            }
        }
    }

    /// One last attempt per record, bounded by `deadline`.
    async fn drain(
        &self,
        queue: Vec<(Instant, AlertRecord)>,
        exhausted: &mpsc::UnboundedSender<AlertRecord>,
        deadline: Instant,
    ) -> Vec<AlertRecord> {
        let mut remaining = Vec::new();

        for (_, mut alert) in queue {
            if Instant::now() >= deadline {
                remaining.push(alert);
                continue;
            }
            match timeout_at(deadline, self.send(&mut alert)).await {
                Ok(DispatchResult::Sent) => {}
                Ok(DispatchResult::FailedPermanently { .. }) => {
                    let _ = exhausted.send(alert);
                }
                Ok(DispatchResult::RetryScheduled { .. }) | Err(_) => remaining.push(alert),
            }
        }

        if !remaining.is_empty() {
            info!(
                pending = remaining.len(),
                "Dispatcher stopped with undelivered alerts"
            );
        }
        remaining
    }
}

async fn sleep_until_due(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Cheap, cloneable sender side of a running dispatcher.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::UnboundedSender<AlertRecord>,
}

impl DispatchHandle {
    /// Queue a record for delivery. Returns `false` once the worker is gone.
    pub fn enqueue(&self, alert: AlertRecord) -> bool {
        self.tx.send(alert).is_ok()
    }
}

/// A spawned dispatcher.
pub struct DispatchWorker {
    pub handle: DispatchHandle,
    /// Records that exhausted `max_attempts`.
    pub exhausted: mpsc::UnboundedReceiver<AlertRecord>,
    /// Resolves to the records still pending at shutdown.
    pub join: JoinHandle<Vec<AlertRecord>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertKind, Severity, WebhookMessage};
    use crate::error::ChannelError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` sends, then succeeds.
    struct FlakyChannel {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl NotifyChannel for FlakyChannel {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn enabled(&self) -> bool {
            true
        }

        async fn send(&self, _message: &WebhookMessage) -> Result<(), ChannelError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(ChannelError::Rejected {
                    status: 500,
                    body: "boom".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn record() -> AlertRecord {
        AlertRecord::new(
            "kospi-close",
            Severity::Warning,
            AlertKind::Escalation,
            "KOSPI close delayed",
            "25 minutes late",
            Utc::now(),
        )
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(10),
            max_attempts,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let p = policy(10);
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(2), Duration::from_secs(2));
        assert_eq!(p.delay_for(3), Duration::from_secs(4));
        assert_eq!(p.delay_for(4), Duration::from_secs(8));
        assert_eq!(p.delay_for(5), Duration::from_secs(10));
        assert_eq!(p.delay_for(500), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_send_schedules_retry_then_fails_permanently() {
        let channel = Arc::new(FlakyChannel {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let dispatcher = Dispatcher::new(channel, policy(2));
        let mut alert = record();

        let first = dispatcher.send(&mut alert).await;
        assert_eq!(
            first,
            DispatchResult::RetryScheduled {
                attempt: 1,
                retry_in: Duration::from_secs(1)
            }
        );
        assert_eq!(alert.status, DispatchStatus::Pending);
        assert!(alert.next_retry_at.is_some());

        let second = dispatcher.send(&mut alert).await;
        assert_eq!(second, DispatchResult::FailedPermanently { attempts: 2 });
        assert_eq!(alert.status, DispatchStatus::Failed);
        assert!(alert.last_error.as_deref().unwrap().contains("500"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_retries_until_delivered() {
        let channel = Arc::new(FlakyChannel {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let dispatcher = Dispatcher::new(channel.clone(), policy(5));
        let cancel = CancellationToken::new();
        let worker = dispatcher.spawn(cancel.clone(), Duration::from_secs(1));

        assert!(worker.handle.enqueue(record()));

        // 1s + 2s of backoff after the two failures.
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(channel.calls.load(Ordering::SeqCst), 3);

        cancel.cancel();
        let pending = worker.join.await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_reports_exhausted_records() {
        let channel = Arc::new(FlakyChannel {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let dispatcher = Dispatcher::new(channel, policy(2));
        let cancel = CancellationToken::new();
        let mut worker = dispatcher.spawn(cancel.clone(), Duration::from_secs(1));

        worker.handle.enqueue(record());
        tokio::time::sleep(Duration::from_secs(3)).await;

        let failed = worker.exhausted.try_recv().unwrap();
        assert_eq!(failed.status, DispatchStatus::Failed);
        assert_eq!(failed.attempts, 2);

        cancel.cancel();
        assert!(worker.join.await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_returns_pending_records() {
        let channel = Arc::new(FlakyChannel {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let dispatcher = Dispatcher::new(channel, policy(10));
        let cancel = CancellationToken::new();
        let worker = dispatcher.spawn(cancel.clone(), Duration::from_secs(1));

        worker.handle.enqueue(record());
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let pending = worker.join.await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, DispatchStatus::Pending);
        assert!(pending[0].attempts >= 1);
    }
}
