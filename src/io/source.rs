//! Location source interface
//!
//! The platform location service sits behind [`LocationSource`]. Fixes reach
//! the session through a bounded channel via [`FixSender`], which also
//! stamps the liveness timestamp the watchdog reads.

use crate::domain::types::RawFix;
use crate::infra::clock::Clock;
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("location source unavailable: {0}")]
    Unavailable(String),
    #[error("location source call timed out after {0} ms")]
    Timeout(u64),
}

#[async_trait]
pub trait LocationSource: Send + Sync {
    async fn start(&self) -> Result<(), SourceError>;
    async fn stop(&self) -> Result<(), SourceError>;
    /// Tear down and start again, used by the watchdog
    async fn restart(&self) -> Result<(), SourceError>;
}

/// Bound a call into the location source
pub async fn call_with_timeout<F>(timeout_ms: u64, call: F) -> Result<(), SourceError>
where
    F: Future<Output = Result<(), SourceError>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), call).await {
        Ok(result) => result,
        Err(_) => Err(SourceError::Timeout(timeout_ms)),
    }
}

/// Epoch ms of the last fix the source delivered, 0 before any fix
#[derive(Debug, Clone, Default)]
pub struct SourceLiveness(Arc<AtomicU64>);

impl SourceLiveness {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn stamp(&self, now_ms: u64) {
        self.0.store(now_ms, Ordering::Relaxed);
    }

    #[inline]
    pub fn last_ms(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Producer side of the fix channel
#[derive(Clone)]
pub struct FixSender {
    tx: mpsc::Sender<RawFix>,
    liveness: SourceLiveness,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl FixSender {
    pub fn new(
        tx: mpsc::Sender<RawFix>,
        liveness: SourceLiveness,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { tx, liveness, clock, metrics }
    }

    /// Hand a fix to the session. Returns false if it was dropped.
    pub fn send(&self, fix: RawFix) -> bool {
        self.liveness.stamp(self.clock.now_ms());
        match self.tx.try_send(fix) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.record_fix_dropped();
                warn!(timestamp_ms = %fix.timestamp_ms, "fix_dropped_channel_full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Wait for channel space instead of dropping
    pub async fn send_wait(&self, fix: RawFix) -> bool {
        self.liveness.stamp(self.clock.now_ms());
        self.tx.send(fix).await.is_ok()
    }

    pub fn liveness(&self) -> &SourceLiveness {
        &self.liveness
    }
}

/// Create the fix channel with its liveness stamp
pub fn fix_channel(
    capacity: usize,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
) -> (FixSender, mpsc::Receiver<RawFix>, SourceLiveness) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let liveness = SourceLiveness::new();
    (FixSender::new(tx, liveness.clone(), clock, metrics), rx, liveness)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::clock::ManualClock;

    #[tokio::test]
    async fn test_send_stamps_liveness() {
        let clock = Arc::new(ManualClock::new(5_000));
        let (sender, mut rx, liveness) = fix_channel(4, clock.clone(), Arc::new(Metrics::new()));
        assert_eq!(liveness.last_ms(), 0);

        assert!(sender.send(RawFix::new(48.0, 2.0, 1)));
        assert_eq!(liveness.last_ms(), 5_000);
        assert_eq!(rx.recv().await.map(|f| f.timestamp_ms), Some(1));
    }

    #[tokio::test]
    async fn test_full_channel_drops_and_counts() {
        let clock = Arc::new(ManualClock::new(0));
        let metrics = Arc::new(Metrics::new());
        let (sender, _rx, _liveness) = fix_channel(1, clock, metrics.clone());

        assert!(sender.send(RawFix::new(48.0, 2.0, 1)));
        assert!(!sender.send(RawFix::new(48.0, 2.0, 2)));
        assert_eq!(metrics.fixes_dropped(), 1);
    }

    #[tokio::test]
    async fn test_call_with_timeout() {
        assert_eq!(call_with_timeout(50, async { Ok(()) }).await, Ok(()));

        let hung = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        };
        assert_eq!(call_with_timeout(20, hung).await, Err(SourceError::Timeout(20)));
    }
}
