//! Point validation
//!
//! Ordered rules run against the current validation window (points of the
//! current segment after the trust boundary). The first matching rule wins.

use crate::domain::geo;
use crate::domain::types::{RejectReason, TrackPoint, ValidationOutcome};
use crate::infra::config::ValidatorConfig;

/// A smoothed fix waiting to be judged
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp_ms: u64,
    pub altitude_m: f64,
    /// Estimator output (km/h)
    pub speed_kmh: f64,
    /// Device-reported speed (km/h), 0 when unknown
    pub reported_speed_kmh: f64,
    pub accuracy_m: f64,
    /// Whether the raw fix had representable coordinates
    pub raw_valid: bool,
}

/// Measurements of a candidate relative to the last window point
struct Motion {
    distance_m: f64,
    dt_ms: u64,
    computed_kmh: f64,
}

impl Motion {
    fn between(last: &TrackPoint, candidate: &Candidate) -> Self {
        let distance_m =
            geo::haversine_m(last.latitude, last.longitude, candidate.latitude, candidate.longitude);
        let dt_ms = candidate.timestamp_ms.saturating_sub(last.timestamp_ms);
        let computed_kmh =
            if dt_ms > 0 { distance_m / (dt_ms as f64 / 1000.0) * 3.6 } else { 0.0 };
        Self { distance_m, dt_ms, computed_kmh }
    }
}

pub struct PointValidator {
    config: ValidatorConfig,
}

impl PointValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Run every rule against the candidate
    pub fn validate(&self, window: &[TrackPoint], candidate: &Candidate) -> ValidationOutcome {
        // Rule 1: first point of a segment or trust region
        let Some(last) = window.last() else {
            if !Self::coordinates_valid(candidate) {
                return ValidationOutcome::reject(RejectReason::InvalidCoordinates, 0.0, 0.0, 0.0);
            }
            return ValidationOutcome::accept(0.0, candidate.speed_kmh, 0.0);
        };

        if let Some(outcome) = self.check_hard(window, candidate) {
            return outcome;
        }

        let motion = Motion::between(last, candidate);
        let speed = Self::rule_speed(candidate, &motion);

        // Rule 5: direction changes against the last two stored points
        let mut bearing_delta = 0.0;
        if let [.., prev, last] = window {
            let leg_m = geo::haversine_m(prev.latitude, prev.longitude, last.latitude, last.longitude);
            if leg_m >= 1.0 {
                let prev_bearing =
                    geo::bearing_deg(prev.latitude, prev.longitude, last.latitude, last.longitude);
                let cand_bearing = geo::bearing_deg(
                    last.latitude,
                    last.longitude,
                    candidate.latitude,
                    candidate.longitude,
                );
                bearing_delta = geo::bearing_delta_deg(prev_bearing, cand_bearing);

                if let Some(reason) = self.direction_rule(bearing_delta, &motion, speed) {
                    return ValidationOutcome::reject(reason, motion.distance_m, speed, bearing_delta);
                }
            }
        }

        // Rule 6: computed speed incoherent with the device report
        let c = &self.config;
        if candidate.reported_speed_kmh > c.incoherence_min_reported_kmh
            && motion.computed_kmh > c.incoherence_factor * candidate.reported_speed_kmh
        {
            return ValidationOutcome::reject(
                RejectReason::SpeedIncoherence,
                motion.distance_m,
                motion.computed_kmh,
                bearing_delta,
            );
        }

        // Rule 7: poor horizontal accuracy
        if candidate.accuracy_m.is_finite() && candidate.accuracy_m > c.max_accuracy_m {
            return ValidationOutcome::reject(
                RejectReason::LowAccuracy,
                motion.distance_m,
                speed,
                bearing_delta,
            );
        }

        ValidationOutcome::accept(motion.distance_m, speed, bearing_delta)
    }

    /// Rules 2-4 only: invalid coordinates, stationary noise, teleportation.
    ///
    /// Returns `None` when the candidate passes. Requires a non-empty window.
    fn check_hard(&self, window: &[TrackPoint], candidate: &Candidate) -> Option<ValidationOutcome> {
        let last = window.last()?;

        if !Self::coordinates_valid(candidate) {
            return Some(ValidationOutcome::reject(RejectReason::InvalidCoordinates, 0.0, 0.0, 0.0));
        }

        let motion = Motion::between(last, candidate);
        let speed = Self::rule_speed(candidate, &motion);
        let c = &self.config;

        if motion.distance_m < c.stationary_distance_m && speed < c.stationary_speed_kmh {
            return Some(ValidationOutcome::reject(
                RejectReason::StationaryNoise,
                motion.distance_m,
                speed,
                0.0,
            ));
        }

        if motion.distance_m > self.teleport_limit_m(window, candidate, motion.dt_ms) {
            return Some(ValidationOutcome::reject(
                RejectReason::Teleportation,
                motion.distance_m,
                motion.computed_kmh,
                0.0,
            ));
        }

        None
    }

    /// Whether a candidate may confirm the confirmation buffer. It has to
    /// clear the hard rules itself before it can vouch for earlier points.
    pub fn can_confirm(&self, window: &[TrackPoint], candidate: &Candidate) -> bool {
        Self::coordinates_valid(candidate) && self.check_hard(window, candidate).is_none()
    }

    /// Pre-check applied to a fix that ends a short signal gap. Only
    /// invalid coordinates and teleportation block interpolation.
    pub fn blocks_interpolation(&self, window: &[TrackPoint], candidate: &Candidate) -> bool {
        if !Self::coordinates_valid(candidate) {
            return true;
        }
        let Some(last) = window.last() else {
            return false;
        };
        let motion = Motion::between(last, candidate);
        motion.distance_m > self.teleport_limit_m(window, candidate, motion.dt_ms)
    }

    /// max(floor, factor × expected displacement)
    fn teleport_limit_m(&self, window: &[TrackPoint], candidate: &Candidate, dt_ms: u64) -> f64 {
        let recent_mps = match window {
            [.., prev, last] => {
                let dt_s = last.timestamp_ms.saturating_sub(prev.timestamp_ms) as f64 / 1000.0;
                if dt_s > 0.0 {
                    geo::haversine_m(prev.latitude, prev.longitude, last.latitude, last.longitude)
                        / dt_s
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        let reported_mps = candidate.reported_speed_kmh / 3.6;
        let expected_m = recent_mps.max(reported_mps) * (dt_ms as f64 / 1000.0);
        self.config.teleport_floor_m.max(self.config.teleport_factor * expected_m)
    }

    fn direction_rule(&self, delta: f64, motion: &Motion, speed: f64) -> Option<RejectReason> {
        let c = &self.config;
        let d = motion.distance_m;

        if delta > c.sharp_zigzag_deg && d < c.sharp_zigzag_max_m && speed > c.sharp_zigzag_min_kmh {
            return Some(RejectReason::SharpZigzag);
        }
        if delta > c.micro_zigzag_deg && d < c.micro_zigzag_max_m && speed > c.micro_zigzag_min_kmh {
            return Some(RejectReason::MicroZigzag);
        }
        if delta > c.backward_deg && d < c.backward_max_m {
            return Some(RejectReason::BackwardMovement);
        }
        if delta > c.rapid_zigzag_deg
            && motion.dt_ms < c.rapid_zigzag_max_ms
            && d < c.rapid_zigzag_max_m
        {
            return Some(RejectReason::ZigzagRapid);
        }
        if delta > c.unstable_deg
            && motion.dt_ms < c.unstable_max_ms
            && speed > c.unstable_min_kmh
            && d > c.unstable_min_m
        {
            return Some(RejectReason::BearingUnstable);
        }
        None
    }

    /// Device speed when reported, otherwise the speed implied by displacement
    #[inline]
    fn rule_speed(candidate: &Candidate, motion: &Motion) -> f64 {
        if candidate.reported_speed_kmh > 0.0 {
            candidate.speed_kmh.max(0.0)
        } else {
            motion.computed_kmh
        }
    }

    #[inline]
    fn coordinates_valid(candidate: &Candidate) -> bool {
        candidate.raw_valid && geo::is_valid_coordinate(candidate.latitude, candidate.longitude)
    }
}
