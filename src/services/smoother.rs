//! Coordinate smoothing with a 2D random-walk Kalman filter
//!
//! State is (lat, lon) in degrees with a diagonal-initialised 2×2 covariance.
//! Noise figures are configured in square meters and converted to square
//! degrees at the current latitude on every step.

use crate::domain::geo::{self, METERS_PER_DEG};
use crate::infra::config::SmootherConfig;
use nalgebra::{Matrix2, Vector2};
use tracing::debug;

/// Filter state; `None` on the smoother means uninitialised
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KalmanState {
    pub mean: Vector2<f64>,
    pub covariance: Matrix2<f64>,
    pub last_ts_ms: u64,
}

/// Session-wide coordinate smoother
pub struct CoordinateSmoother {
    config: SmootherConfig,
    state: Option<KalmanState>,
}

impl CoordinateSmoother {
    pub fn new(config: SmootherConfig) -> Self {
        Self { config, state: None }
    }

    /// Convert an isotropic variance in m² to per-axis variances in deg²
    fn variance_deg2(&self, variance_m2: f64, lat: f64) -> Matrix2<f64> {
        let m_per_deg_lon = geo::meters_per_deg_lon(lat);
        Matrix2::new(
            variance_m2 / (METERS_PER_DEG * METERS_PER_DEG),
            0.0,
            0.0,
            variance_m2 / (m_per_deg_lon * m_per_deg_lon),
        )
    }

    /// Smooth one coordinate, returning the filtered (lat, lon)
    pub fn smooth(&mut self, lat: f64, lon: f64, timestamp_ms: u64) -> (f64, f64) {
        if !geo::is_valid_coordinate(lat, lon) {
            return geo::clamp_coordinate(lat, lon);
        }

        let Some(state) = self.state else {
            self.state = Some(KalmanState {
                mean: Vector2::new(lat, lon),
                covariance: self.variance_deg2(self.config.initial_covariance_m2, lat),
                last_ts_ms: timestamp_ms,
            });
            return (lat, lon);
        };

        match self.step(&state, lat, lon, timestamp_ms) {
            Some(next) => {
                self.state = Some(next);
                (next.mean[0], next.mean[1])
            }
            None => {
                debug!(lat = %lat, lon = %lon, "smoother_fallback_raw");
                (lat, lon)
            }
        }
    }

    /// Predict + correct. `None` on numerical failure.
    fn step(&self, state: &KalmanState, lat: f64, lon: f64, ts_ms: u64) -> Option<KalmanState> {
        let dt_s = ts_ms.saturating_sub(state.last_ts_ms) as f64 / 1000.0;

        // Predict: identity transition, process noise grows with elapsed time
        let q = self.variance_deg2(self.config.process_noise_m2_per_s * dt_s, lat);
        let p_pred = state.covariance + q;

        // Correct
        let r = self.variance_deg2(self.config.observation_noise_m2, lat);
        let z = Vector2::new(lat, lon);
        let innovation = z - state.mean;
        let s = p_pred + r;
        let s_inv = s.try_inverse()?;
        let k = p_pred * s_inv;

        let mean = state.mean + k * innovation;
        let covariance = (Matrix2::identity() - k) * p_pred;

        let finite = mean.iter().all(|v| v.is_finite()) && covariance.iter().all(|v| v.is_finite());
        if !finite || !geo::is_valid_coordinate(mean[0], mean[1]) {
            return None;
        }

        Some(KalmanState { mean, covariance, last_ts_ms: ts_ms })
    }

    /// Current state, for rollback after a rejected point
    pub fn snapshot(&self) -> Option<KalmanState> {
        self.state
    }

    pub fn restore(&mut self, state: Option<KalmanState>) {
        self.state = state;
    }

    pub fn reset(&mut self) {
        self.state = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }
}
