//! Speed smoothing and max-speed tracking
//!
//! `SpeedEstimator` turns device-reported m/s into a km/h figure that
//! ignores single-sample jumps. `MaxSpeedTracker` keeps the trip maximum and
//! refuses to let a lone still-to-fast spike become the record.

use crate::infra::config::SpeedConfig;
use std::collections::VecDeque;

/// Rolling speed estimator
pub struct SpeedEstimator {
    window: VecDeque<f64>,
    window_size: usize,
    jump_threshold_kmh: f64,
    previous_kmh: Option<f64>,
}

impl SpeedEstimator {
    pub fn new(config: &SpeedConfig) -> Self {
        let window_size = config.window.max(1);
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
            jump_threshold_kmh: config.jump_threshold_kmh,
            previous_kmh: None,
        }
    }

    /// Feed a raw m/s sample and return the km/h estimate
    pub fn estimate(&mut self, speed_mps: f64) -> f64 {
        let kmh = if speed_mps.is_finite() && speed_mps > 0.0 { speed_mps * 3.6 } else { 0.0 };

        self.window.push_back(kmh);
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }

        let jumped = self
            .previous_kmh
            .is_some_and(|prev| (kmh - prev).abs() > self.jump_threshold_kmh);
        self.previous_kmh = Some(kmh);

        if jumped {
            self.window.iter().sum::<f64>() / self.window.len() as f64
        } else {
            kmh
        }
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.previous_kmh = None;
    }
}

/// Trip maximum with deferred confirmation of spikes from standstill
pub struct MaxSpeedTracker {
    still_kmh: f64,
    fast_kmh: f64,
    confirm_ms: u64,
    max_kmh: f64,
    previous_kmh: f64,
    /// (speed, timestamp) of a spike awaiting its follow-up sample
    pending: Option<(f64, u64)>,
}

impl MaxSpeedTracker {
    pub fn new(config: &SpeedConfig) -> Self {
        Self {
            still_kmh: config.still_kmh,
            fast_kmh: config.fast_kmh,
            confirm_ms: config.spike_confirm_ms,
            max_kmh: 0.0,
            previous_kmh: 0.0,
            pending: None,
        }
    }

    pub fn update(&mut self, speed_kmh: f64, timestamp_ms: u64) {
        let speed_kmh = if speed_kmh.is_finite() { speed_kmh.max(0.0) } else { 0.0 };

        if let Some((spike, spike_ts)) = self.pending.take() {
            if timestamp_ms.saturating_sub(spike_ts) <= self.confirm_ms {
                if speed_kmh > self.still_kmh {
                    self.max_kmh = self.max_kmh.max(spike.max(speed_kmh));
                }
                self.previous_kmh = speed_kmh;
                return;
            }
            // Expired spike is dropped; this sample is judged on its own
        }

        if self.previous_kmh <= self.still_kmh && speed_kmh >= self.fast_kmh {
            self.pending = Some((speed_kmh, timestamp_ms));
        } else {
            self.max_kmh = self.max_kmh.max(speed_kmh);
        }
        self.previous_kmh = speed_kmh;
    }

    pub fn max_kmh(&self) -> f64 {
        self.max_kmh
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Restore a persisted maximum
    pub fn set_max(&mut self, max_kmh: f64) {
        if max_kmh.is_finite() && max_kmh > 0.0 {
            self.max_kmh = max_kmh;
        }
    }

    pub fn reset(&mut self) {
        self.max_kmh = 0.0;
        self.previous_kmh = 0.0;
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SpeedConfig {
        SpeedConfig::default()
    }

    #[test]
    fn test_estimate_converts_and_clamps() {
        let mut est = SpeedEstimator::new(&config());
        assert!((est.estimate(10.0) - 36.0).abs() < 1e-9);

        let mut est = SpeedEstimator::new(&config());
        assert_eq!(est.estimate(-3.0), 0.0);
        assert_eq!(est.estimate(f64::NAN), 0.0);
    }

    #[test]
    fn test_jump_returns_window_average() {
        let mut est = SpeedEstimator::new(&config());
        est.estimate(10.0 / 3.6);
        est.estimate(10.0 / 3.6);
        // 10 -> 40 km/h exceeds the 5 km/h jump threshold
        let v = est.estimate(40.0 / 3.6);
        assert!((v - 20.0).abs() < 1e-9, "got {v}");

        // Small change passes through
        let v = est.estimate(42.0 / 3.6);
        assert!((v - 42.0).abs() < 1e-9, "got {v}");
    }

    #[test]
    fn test_window_is_bounded() {
        let mut est = SpeedEstimator::new(&config());
        for _ in 0..10 {
            est.estimate(1.0);
        }
        assert_eq!(est.window.len(), 3);
    }

    #[test]
    fn test_spike_from_still_confirmed_by_moving_sample() {
        let mut max = MaxSpeedTracker::new(&config());
        max.update(0.0, 0);
        max.update(30.0, 1000);
        assert!(max.has_pending());
        assert_eq!(max.max_kmh(), 0.0);

        max.update(20.0, 2000);
        assert!(!max.has_pending());
        assert_eq!(max.max_kmh(), 30.0);
    }

    #[test]
    fn test_spike_followed_by_still_is_discarded() {
        let mut max = MaxSpeedTracker::new(&config());
        max.update(0.0, 0);
        max.update(80.0, 1000);
        max.update(0.5, 2000);
        assert_eq!(max.max_kmh(), 0.0);
    }

    #[test]
    fn test_expired_spike_is_discarded() {
        let mut max = MaxSpeedTracker::new(&config());
        max.update(80.0, 0);
        assert!(max.has_pending());

        // Follow-up arrives after the confirmation window
        max.update(3.0, 4000);
        assert!(!max.has_pending());
        assert_eq!(max.max_kmh(), 3.0);
    }

    #[test]
    fn test_gradual_acceleration_updates_directly() {
        let mut max = MaxSpeedTracker::new(&config());
        for (i, v) in [2.0, 4.0, 8.0, 15.0, 12.0].iter().enumerate() {
            max.update(*v, i as u64 * 1000);
        }
        assert!(!max.has_pending());
        assert_eq!(max.max_kmh(), 15.0);
    }
}
