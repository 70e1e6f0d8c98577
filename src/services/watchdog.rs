//! Background watchdog for the location source
//!
//! Some platforms silently stop delivering fixes to a backgrounded app. The
//! watchdog compares the source liveness stamp with the clock and restarts
//! the source once per silence window while a session is running.

use crate::domain::types::SessionStatus;
use crate::infra::clock::Clock;
use crate::infra::config::WatchdogConfig;
use crate::infra::metrics::Metrics;
use crate::io::source::{call_with_timeout, LocationSource, SourceError, SourceLiveness};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, warn};

/// Raised for the user when recovery did not work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogAlert {
    RestartFailed { silent_ms: u64, error: SourceError },
}

/// Result of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Session is not running; nothing to watch
    NotRunning,
    Healthy,
    Restarted,
    /// Still silent, but this window already had its restart
    AlreadyRestarted,
    RestartFailed,
}

pub struct Watchdog {
    source: Arc<dyn LocationSource>,
    status_rx: watch::Receiver<SessionStatus>,
    liveness: SourceLiveness,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    config: WatchdogConfig,
    alert_tx: mpsc::Sender<WatchdogAlert>,
    /// Liveness value the last restart was made for
    restarted_for: Option<u64>,
    /// Start of silence when no fix has arrived yet in this run
    watching_since: Option<u64>,
}

impl Watchdog {
    pub fn new(
        source: Arc<dyn LocationSource>,
        status_rx: watch::Receiver<SessionStatus>,
        liveness: SourceLiveness,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        config: WatchdogConfig,
        alert_tx: mpsc::Sender<WatchdogAlert>,
    ) -> Self {
        Self {
            source,
            status_rx,
            liveness,
            clock,
            metrics,
            config,
            alert_tx,
            restarted_for: None,
            watching_since: None,
        }
    }

    /// One liveness check at `now_ms`
    pub async fn check(&mut self, now_ms: u64) -> WatchdogAction {
        let status = *self.status_rx.borrow();
        if status != SessionStatus::Running {
            // A new trip gets a fresh restart budget
            self.watching_since = None;
            self.restarted_for = None;
            return WatchdogAction::NotRunning;
        }

        let last = self.liveness.last_ms();
        // Before the first fix, silence counts from when watching began
        let silent_since = if last > 0 { last } else { *self.watching_since.get_or_insert(now_ms) };
        let silent_ms = now_ms.saturating_sub(silent_since);

        if silent_ms <= self.config.silence_threshold_secs * 1000 {
            return WatchdogAction::Healthy;
        }
        if self.restarted_for == Some(last) {
            debug!(silent_ms = %silent_ms, "watchdog_waiting_for_source");
            return WatchdogAction::AlreadyRestarted;
        }

        self.restarted_for = Some(last);
        warn!(silent_ms = %silent_ms, "source_silent_restarting");

        match call_with_timeout(self.config.restart_timeout_ms, self.source.restart()).await {
            Ok(()) => {
                self.metrics.record_watchdog_restart();
                warn!(silent_ms = %silent_ms, "source_restarted");
                WatchdogAction::Restarted
            }
            Err(e) => {
                self.metrics.record_watchdog_failure();
                error!(silent_ms = %silent_ms, error = %e, "source_restart_failed");
                let alert = WatchdogAlert::RestartFailed { silent_ms, error: e };
                if self.alert_tx.try_send(alert).is_err() {
                    warn!("watchdog_alert_dropped");
                }
                WatchdogAction::RestartFailed
            }
        }
    }

    /// Check on an interval until shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.config.check_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = self.clock.now_ms();
                    self.check(now).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("watchdog_stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::clock::ManualClock;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingSource {
        restarts: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl LocationSource for CountingSource {
        async fn start(&self) -> Result<(), SourceError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), SourceError> {
            Ok(())
        }

        async fn restart(&self) -> Result<(), SourceError> {
            self.restarts.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                Err(SourceError::Unavailable("gps off".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        watchdog: Watchdog,
        source: Arc<CountingSource>,
        status_tx: watch::Sender<SessionStatus>,
        liveness: SourceLiveness,
        alert_rx: mpsc::Receiver<WatchdogAlert>,
        metrics: Arc<Metrics>,
    }

    fn harness(fail: bool) -> Harness {
        let source = Arc::new(CountingSource { fail, ..CountingSource::default() });
        let (status_tx, status_rx) = watch::channel(SessionStatus::Running);
        let (alert_tx, alert_rx) = mpsc::channel(4);
        let liveness = SourceLiveness::new();
        let metrics = Arc::new(Metrics::new());
        let watchdog = Watchdog::new(
            source.clone(),
            status_rx,
            liveness.clone(),
            Arc::new(ManualClock::new(0)),
            metrics.clone(),
            WatchdogConfig::default(),
            alert_tx,
        );
        Harness { watchdog, source, status_tx, liveness, alert_rx, metrics }
    }

    #[tokio::test]
    async fn test_healthy_source_left_alone() {
        let mut h = harness(false);
        h.liveness.stamp(100_000);

        assert_eq!(h.watchdog.check(150_000).await, WatchdogAction::Healthy);
        assert_eq!(h.source.restarts.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_one_restart_per_silence_window() {
        let mut h = harness(false);
        h.liveness.stamp(1_000_000);

        // Checks every 10 s over 65 s of silence
        let mut actions = Vec::new();
        for t in (10_000..=70_000).step_by(10_000) {
            actions.push(h.watchdog.check(1_000_000 + t).await);
        }

        assert_eq!(h.source.restarts.load(Ordering::Relaxed), 1);
        assert_eq!(actions.iter().filter(|a| **a == WatchdogAction::Restarted).count(), 1);
        assert_eq!(h.watchdog.check(1_075_000).await, WatchdogAction::AlreadyRestarted);

        // Liveness advances, then goes silent again: a new window
        h.liveness.stamp(1_080_000);
        assert_eq!(h.watchdog.check(1_090_000).await, WatchdogAction::Healthy);
        assert_eq!(h.watchdog.check(1_145_000).await, WatchdogAction::Restarted);
        assert_eq!(h.metrics.watchdog_restarts(), 2);
    }

    #[tokio::test]
    async fn test_ignored_unless_running() {
        let mut h = harness(false);
        h.status_tx.send_replace(SessionStatus::Paused);
        h.liveness.stamp(1);

        assert_eq!(h.watchdog.check(500_000).await, WatchdogAction::NotRunning);
        assert_eq!(h.source.restarts.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_silence_before_first_fix() {
        let mut h = harness(false);

        assert_eq!(h.watchdog.check(5_000).await, WatchdogAction::Healthy);
        assert_eq!(h.watchdog.check(64_000).await, WatchdogAction::Healthy);
        assert_eq!(h.watchdog.check(66_000).await, WatchdogAction::Restarted);
    }

    #[tokio::test]
    async fn test_restart_budget_renewed_for_next_trip() {
        let mut h = harness(false);

        // First trip never delivers a fix
        assert_eq!(h.watchdog.check(10_000).await, WatchdogAction::Healthy);
        assert_eq!(h.watchdog.check(75_000).await, WatchdogAction::Restarted);
        assert_eq!(h.watchdog.check(85_000).await, WatchdogAction::AlreadyRestarted);

        h.status_tx.send_replace(SessionStatus::Idle);
        assert_eq!(h.watchdog.check(90_000).await, WatchdogAction::NotRunning);

        // Second trip, source still dead
        h.status_tx.send_replace(SessionStatus::Running);
        assert_eq!(h.watchdog.check(100_000).await, WatchdogAction::Healthy);
        assert_eq!(h.watchdog.check(170_000).await, WatchdogAction::Restarted);
        assert_eq!(h.source.restarts.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_restart_failure_alerts() {
        let mut h = harness(true);
        h.liveness.stamp(10_000);

        assert_eq!(h.watchdog.check(80_000).await, WatchdogAction::RestartFailed);
        assert_eq!(h.metrics.watchdog_failures(), 1);

        match h.alert_rx.try_recv() {
            Ok(WatchdogAlert::RestartFailed { silent_ms, error }) => {
                assert_eq!(silent_ms, 70_000);
                assert_eq!(error, SourceError::Unavailable("gps off".to_string()));
            }
            other => panic!("expected alert, got {:?}", other),
        }
    }
}
