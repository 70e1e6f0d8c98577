//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use crate::domain::types::RejectReason;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Ratios are kept as parts-per-thousand so they fit in an atomic
#[inline]
fn to_permille(ratio: f64) -> u64 {
    if ratio.is_finite() && ratio > 0.0 {
        (ratio * 1000.0).round() as u64
    } else {
        0
    }
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps periodic counters to get a consistent snapshot.
pub struct Metrics {
    /// Raw fixes handed to the pipeline (monotonic)
    fixes_received: AtomicU64,
    /// Fixes since last report (reset on report)
    fixes_since_report: AtomicU64,
    /// Fixes dropped because the session channel was full (monotonic)
    fixes_dropped: AtomicU64,
    points_stored: AtomicU64,
    points_sampled_out: AtomicU64,
    /// Validator rejections, indexed by `RejectReason::index`
    rejected: [AtomicU64; RejectReason::COUNT],
    points_buffered: AtomicU64,
    points_promoted: AtomicU64,
    /// Buffered points that aged out or went stale
    buffer_dropped: AtomicU64,
    points_interpolated: AtomicU64,
    estimated_stretches: AtomicU64,
    persist_writes: AtomicU64,
    persist_failures: AtomicU64,
    persist_retries: AtomicU64,
    /// Restores that fell back to backup or an empty trace
    restore_fallbacks: AtomicU64,
    watchdog_restarts: AtomicU64,
    watchdog_failures: AtomicU64,
    simplifier_runs: AtomicU64,
    /// Last simplified/original point ratio (permille)
    simplify_ratio_permille: AtomicU64,
    /// Last polyline bytes / raw coordinate bytes (permille)
    compression_permille: AtomicU64,
    /// Sum of ingest latencies in microseconds (reset on report)
    ingest_latency_sum_us: AtomicU64,
    /// Max ingest latency in microseconds (reset on report)
    ingest_latency_max_us: AtomicU64,
    /// Ingest latency histogram buckets (reset on report)
    ingest_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            fixes_received: AtomicU64::new(0),
            fixes_since_report: AtomicU64::new(0),
            fixes_dropped: AtomicU64::new(0),
            points_stored: AtomicU64::new(0),
            points_sampled_out: AtomicU64::new(0),
            rejected: std::array::from_fn(|_| AtomicU64::new(0)),
            points_buffered: AtomicU64::new(0),
            points_promoted: AtomicU64::new(0),
            buffer_dropped: AtomicU64::new(0),
            points_interpolated: AtomicU64::new(0),
            estimated_stretches: AtomicU64::new(0),
            persist_writes: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
            persist_retries: AtomicU64::new(0),
            restore_fallbacks: AtomicU64::new(0),
            watchdog_restarts: AtomicU64::new(0),
            watchdog_failures: AtomicU64::new(0),
            simplifier_runs: AtomicU64::new(0),
            simplify_ratio_permille: AtomicU64::new(0),
            compression_permille: AtomicU64::new(0),
            ingest_latency_sum_us: AtomicU64::new(0),
            ingest_latency_max_us: AtomicU64::new(0),
            ingest_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a fix was ingested with given latency (lock-free)
    #[inline]
    pub fn record_fix_processed(&self, latency_us: u64) {
        self.fixes_received.fetch_add(1, Ordering::Relaxed);
        self.fixes_since_report.fetch_add(1, Ordering::Relaxed);
        self.ingest_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let bucket = bucket_index(latency_us);
        self.ingest_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        update_atomic_max(&self.ingest_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_fix_dropped(&self) {
        self.fixes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_point_stored(&self) {
        self.points_stored.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sampled_out(&self) {
        self.points_sampled_out.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rejected(&self, reason: RejectReason) {
        self.rejected[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_buffered(&self) {
        self.points_buffered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_promoted(&self, count: usize) {
        self.points_promoted.fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_buffer_dropped(&self, count: usize) {
        self.buffer_dropped.fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_interpolated(&self, count: usize) {
        self.points_interpolated.fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_estimated_stretch(&self) {
        self.estimated_stretches.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_persist_write(&self) {
        self.persist_writes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_persist_failure(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_persist_retry(&self) {
        self.persist_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_restore_fallback(&self) {
        self.restore_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_watchdog_restart(&self) {
        self.watchdog_restarts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_watchdog_failure(&self) {
        self.watchdog_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a simplifier pass with its resulting ratios
    #[inline]
    pub fn record_simplification(&self, ratio: f64, compression: f64) {
        self.simplifier_runs.fetch_add(1, Ordering::Relaxed);
        self.simplify_ratio_permille.store(to_permille(ratio), Ordering::Relaxed);
        self.compression_permille.store(to_permille(compression), Ordering::Relaxed);
    }

    #[inline]
    pub fn fixes_received(&self) -> u64 {
        self.fixes_received.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn fixes_dropped(&self) -> u64 {
        self.fixes_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn points_stored(&self) -> u64 {
        self.points_stored.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rejected(&self, reason: RejectReason) -> u64 {
        self.rejected[reason.index()].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rejected_total(&self) -> u64 {
        self.rejected.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    #[inline]
    pub fn points_buffered(&self) -> u64 {
        self.points_buffered.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn points_promoted(&self) -> u64 {
        self.points_promoted.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn buffer_dropped(&self) -> u64 {
        self.buffer_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn watchdog_restarts(&self) -> u64 {
        self.watchdog_restarts.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn watchdog_failures(&self) -> u64 {
        self.watchdog_failures.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn simplifier_runs(&self) -> u64 {
        self.simplifier_runs.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let fixes_count = self.fixes_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.ingest_latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.ingest_latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.ingest_latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let fixes_per_sec = if elapsed.as_secs_f64() > 0.0 {
            fixes_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if fixes_count > 0 { latency_sum / fixes_count } else { 0 };

        let mut rejected_by_reason = [0u64; RejectReason::COUNT];
        for (i, counter) in self.rejected.iter().enumerate() {
            rejected_by_reason[i] = counter.load(Ordering::Relaxed);
        }

        MetricsSummary {
            fixes_total: self.fixes_received.load(Ordering::Relaxed),
            fixes_per_sec,
            fixes_dropped: self.fixes_dropped.load(Ordering::Relaxed),
            points_stored: self.points_stored.load(Ordering::Relaxed),
            points_sampled_out: self.points_sampled_out.load(Ordering::Relaxed),
            rejected_total: rejected_by_reason.iter().sum(),
            rejected_by_reason,
            points_buffered: self.points_buffered.load(Ordering::Relaxed),
            points_promoted: self.points_promoted.load(Ordering::Relaxed),
            buffer_dropped: self.buffer_dropped.load(Ordering::Relaxed),
            points_interpolated: self.points_interpolated.load(Ordering::Relaxed),
            estimated_stretches: self.estimated_stretches.load(Ordering::Relaxed),
            persist_writes: self.persist_writes.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            persist_retries: self.persist_retries.load(Ordering::Relaxed),
            restore_fallbacks: self.restore_fallbacks.load(Ordering::Relaxed),
            watchdog_restarts: self.watchdog_restarts.load(Ordering::Relaxed),
            watchdog_failures: self.watchdog_failures.load(Ordering::Relaxed),
            simplifier_runs: self.simplifier_runs.load(Ordering::Relaxed),
            simplify_ratio: self.simplify_ratio_permille.load(Ordering::Relaxed) as f64 / 1000.0,
            compression_ratio: self.compression_permille.load(Ordering::Relaxed) as f64 / 1000.0,
            avg_ingest_latency_us: avg_latency,
            max_ingest_latency_us: max_latency,
            lat_buckets,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of metrics for reporting
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub fixes_total: u64,
    pub fixes_per_sec: f64,
    pub fixes_dropped: u64,
    pub points_stored: u64,
    pub points_sampled_out: u64,
    pub rejected_total: u64,
    /// Indexed like `RejectReason::ALL`
    pub rejected_by_reason: [u64; RejectReason::COUNT],
    pub points_buffered: u64,
    pub points_promoted: u64,
    pub buffer_dropped: u64,
    pub points_interpolated: u64,
    pub estimated_stretches: u64,
    pub persist_writes: u64,
    pub persist_failures: u64,
    pub persist_retries: u64,
    pub restore_fallbacks: u64,
    pub watchdog_restarts: u64,
    pub watchdog_failures: u64,
    pub simplifier_runs: u64,
    pub simplify_ratio: f64,
    pub compression_ratio: f64,
    pub avg_ingest_latency_us: u64,
    pub max_ingest_latency_us: u64,
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p99_us: u64,
}

impl MetricsSummary {
    /// Rejection count for a single reason
    pub fn rejected(&self, reason: RejectReason) -> u64 {
        self.rejected_by_reason[reason.index()]
    }

    pub fn log(&self) {
        info!(
            fixes_total = %self.fixes_total,
            fixes_per_sec = format!("{:.1}", self.fixes_per_sec),
            dropped = %self.fixes_dropped,
            stored = %self.points_stored,
            sampled_out = %self.points_sampled_out,
            rejected = %self.rejected_total,
            buffered = %self.points_buffered,
            promoted = %self.points_promoted,
            interpolated = %self.points_interpolated,
            persist_failures = %self.persist_failures,
            watchdog_restarts = %self.watchdog_restarts,
            simplify_ratio = format!("{:.3}", self.simplify_ratio),
            avg_latency_us = %self.avg_ingest_latency_us,
            p99_us = %self.lat_p99_us,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.fixes_received(), 0);
        assert_eq!(metrics.rejected_total(), 0);
    }

    #[test]
    fn test_record_fix() {
        let metrics = Metrics::new();

        metrics.record_fix_processed(100);
        assert_eq!(metrics.fixes_received(), 1);
        assert_eq!(metrics.ingest_latency_sum_us.load(Ordering::Relaxed), 100);

        metrics.record_fix_processed(200);
        assert_eq!(metrics.fixes_received(), 2);
        assert_eq!(metrics.ingest_latency_sum_us.load(Ordering::Relaxed), 300);
    }

    #[test]
    fn test_rejections_per_reason() {
        let metrics = Metrics::new();
        metrics.record_rejected(RejectReason::Teleportation);
        metrics.record_rejected(RejectReason::Teleportation);
        metrics.record_rejected(RejectReason::LowAccuracy);

        assert_eq!(metrics.rejected(RejectReason::Teleportation), 2);
        assert_eq!(metrics.rejected(RejectReason::LowAccuracy), 1);
        assert_eq!(metrics.rejected_total(), 3);

        let summary = metrics.report();
        assert_eq!(summary.rejected(RejectReason::Teleportation), 2);
        assert_eq!(summary.rejected_total, 3);
    }

    #[test]
    fn test_report() {
        let metrics = Metrics::new();

        metrics.record_fix_processed(100);
        metrics.record_fix_processed(200);
        metrics.record_fix_processed(300);
        metrics.record_point_stored();
        metrics.record_simplification(0.25, 0.5);

        let summary = metrics.report();

        assert_eq!(summary.fixes_total, 3);
        assert_eq!(summary.avg_ingest_latency_us, 200);
        assert_eq!(summary.max_ingest_latency_us, 300);
        assert_eq!(summary.points_stored, 1);
        assert_eq!(summary.simplifier_runs, 1);
        assert!((summary.simplify_ratio - 0.25).abs() < 1e-9);
        assert!((summary.compression_ratio - 0.5).abs() < 1e-9);

        // Periodic counters should be reset, monotonic ones kept
        assert_eq!(metrics.fixes_since_report.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.ingest_latency_max_us.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.fixes_received(), 3);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    m.record_fix_processed(i as u64);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.fixes_received(), 10_000);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(51201), 10);
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();
        for _ in 0..100 {
            metrics.record_fix_processed(150);
        }

        let summary = metrics.report();
        assert_eq!(summary.lat_p50_us, 200);
        assert_eq!(summary.lat_p99_us, 200);
    }
}
