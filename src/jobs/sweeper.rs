//! Background job: purge expired keys.
//!
//! Runs hourly by default. Each cycle deletes every key whose expiry has
//! passed and posts one message to the notification sink. A failed cycle is
//! logged and the loop carries on with the next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

use crate::clock::Clock;
use crate::errors::KeyError;
use crate::middleware::metrics::PrometheusRecorder;
use crate::notification::Notifier;
use crate::store::KeyStore;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: u64,
    pub notified: bool,
}

pub struct ExpirySweeper {
    store: Arc<dyn KeyStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    notify_on_empty: bool,
    metrics: Option<Arc<PrometheusRecorder>>,
}

impl ExpirySweeper {
    pub fn new(store: Arc<dyn KeyStore>, notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            notifier,
            clock,
            interval: DEFAULT_SWEEP_INTERVAL,
            notify_on_empty: true,
            metrics: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Whether a cycle that removed nothing still posts a notification.
    pub fn with_notify_on_empty(mut self, notify: bool) -> Self {
        self.notify_on_empty = notify;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<PrometheusRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run a single sweep cycle.
    pub async fn run_once(&self) -> Result<SweepReport, KeyError> {
        let now = self.clock.now();
        let removed = self.store.delete_expired_before(now).await?;

        if let Some(m) = &self.metrics {
            m.record_sweep(removed);
        }
        if removed > 0 {
            tracing::info!(removed, "expired keys purged");
        } else {
            tracing::debug!("sweep found no expired keys");
        }

        if removed == 0 && !self.notify_on_empty {
            return Ok(SweepReport {
                removed,
                notified: false,
            });
        }

        let message = format!(
            "Expired keys have been cleared from the database ({} removed).",
            removed
        );
        let notified = match self.notifier.notify(&message).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "sweep notification failed");
                false
            }
        };

        Ok(SweepReport { removed, notified })
    }

    /// Spawn the periodic sweep. The first cycle runs immediately.
    ///
    /// The task exits once `shutdown` flips to `true` or its sender is
    /// dropped. A cycle in progress is never interrupted; shutdown is only
    /// observed between cycles.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = time::interval(self.interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            tracing::info!(interval_secs = self.interval.as_secs(), "expiry sweeper started");

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.run_once().await {
                            if let Some(m) = &self.metrics {
                                m.record_sweep_failure();
                            }
                            tracing::error!("expiry sweep failed: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("expiry sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::key::{BindOutcome, KeyRecord};
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        messages: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, message: &str) -> anyhow::Result<()> {
            self.messages.lock().unwrap().push(message.to_string());
            if self.fail {
                anyhow::bail!("sink down");
            }
            Ok(())
        }
    }

    /// Store whose bulk delete fails on every call, counting attempts.
    #[derive(Default)]
    struct FailingStore {
        sweeps: AtomicUsize,
    }

    #[async_trait]
    impl KeyStore for FailingStore {
        async fn put(&self, _: &str, _: DateTime<Utc>) -> Result<KeyRecord, KeyError> {
            unreachable!()
        }
        async fn get(&self, _: &str) -> Result<Option<KeyRecord>, KeyError> {
            Ok(None)
        }
        async fn set_binding(&self, _: &str, _: &str) -> Result<BindOutcome, KeyError> {
            Ok(BindOutcome::NotFound)
        }
        async fn clear_binding(&self, _: &str) -> Result<(), KeyError> {
            Err(KeyError::NotFound)
        }
        async fn delete(&self, _: &str) -> Result<(), KeyError> {
            Err(KeyError::NotFound)
        }
        async fn delete_expired_before(&self, _: DateTime<Utc>) -> Result<u64, KeyError> {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            Err(KeyError::StoreUnavailable("connection refused".into()))
        }
        async fn list_all(&self) -> Result<Vec<KeyRecord>, KeyError> {
            Ok(vec![])
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc::now()))
    }

    #[tokio::test]
    async fn test_run_once_removes_expired_and_notifies() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let clock = clock();
        store.put("OLDKEY01", clock.now() - ChronoDuration::minutes(1)).await.unwrap();
        store.put("NEWKEY01", clock.now() + ChronoDuration::minutes(1)).await.unwrap();

        let sweeper = ExpirySweeper::new(store.clone(), notifier.clone(), clock);
        let report = sweeper.run_once().await.unwrap();

        assert_eq!(report, SweepReport { removed: 1, notified: true });
        assert_eq!(store.len().await, 1);
        assert_eq!(notifier.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_sweep_still_notifies_by_default() {
        let notifier = Arc::new(RecordingNotifier::default());
        let sweeper = ExpirySweeper::new(Arc::new(MemoryStore::new()), notifier.clone(), clock());

        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report, SweepReport { removed: 0, notified: true });
        assert_eq!(notifier.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_sweep_can_be_silenced() {
        let notifier = Arc::new(RecordingNotifier::default());
        let sweeper = ExpirySweeper::new(Arc::new(MemoryStore::new()), notifier.clone(), clock())
            .with_notify_on_empty(false);

        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report, SweepReport { removed: 0, notified: false });
        assert!(notifier.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_fail_cycle() {
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let sweeper = ExpirySweeper::new(Arc::new(MemoryStore::new()), notifier, clock());
        let report = sweeper.run_once().await.unwrap();
        assert!(!report.notified);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_survives_failures_and_stops_on_shutdown() {
        let store = Arc::new(FailingStore::default());
        let sweeper = ExpirySweeper::new(
            store.clone(),
            Arc::new(RecordingNotifier::default()),
            clock(),
        )
        .with_interval(Duration::from_secs(60));

        let (tx, rx) = watch::channel(false);
        let handle = sweeper.spawn(rx);

        // Immediate first tick plus two more periods.
        time::sleep(Duration::from_secs(121)).await;
        assert_eq!(store.sweeps.load(Ordering::SeqCst), 3);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_when_sender_dropped() {
        let sweeper = ExpirySweeper::new(
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingNotifier::default()),
            clock(),
        );
        let (tx, rx) = watch::channel(false);
        let handle = sweeper.spawn(rx);
        drop(tx);
        handle.await.unwrap();
    }
}
