//! Adaptive sampling of validated candidates

use crate::domain::geo;
use crate::domain::types::TrackPoint;
use crate::infra::config::SamplingConfig;
use crate::services::validator::Candidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleDecision {
    Store,
    /// Received but not stored: too close, too soon, or implausibly fast
    Skip,
}

pub struct SamplingController {
    config: SamplingConfig,
}

impl SamplingController {
    pub fn new(config: SamplingConfig) -> Self {
        Self { config }
    }

    /// Decide against the last stored point of the current segment
    pub fn decide(&self, last_stored: Option<&TrackPoint>, candidate: &Candidate) -> SampleDecision {
        if candidate.speed_kmh > self.config.max_speed_kmh {
            return SampleDecision::Skip;
        }
        let Some(last) = last_stored else {
            return SampleDecision::Store;
        };

        let distance_m =
            geo::haversine_m(last.latitude, last.longitude, candidate.latitude, candidate.longitude);
        let floor_m = if candidate.speed_kmh < self.config.slow_below_kmh {
            self.config.slow_floor_m
        } else {
            self.config.fast_floor_m
        };
        let elapsed_ms = candidate.timestamp_ms.saturating_sub(last.timestamp_ms);

        if distance_m > floor_m || elapsed_ms > self.config.max_interval_ms {
            SampleDecision::Store
        } else {
            SampleDecision::Skip
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::geo::offset_m;
    use crate::domain::types::{PointFlags, SegmentIndex};

    fn last() -> TrackPoint {
        TrackPoint {
            latitude: 48.0,
            longitude: 2.0,
            timestamp_ms: 0,
            speed_kmh: 0.0,
            altitude_m: 0.0,
            heading_deg: 0.0,
            segment_index: SegmentIndex(0),
            flags: PointFlags::default(),
        }
    }

    fn candidate(north_m: f64, ts_ms: u64, speed_kmh: f64) -> Candidate {
        let (latitude, longitude) = offset_m(48.0, 2.0, north_m, 0.0);
        Candidate {
            latitude,
            longitude,
            timestamp_ms: ts_ms,
            altitude_m: 0.0,
            speed_kmh,
            reported_speed_kmh: speed_kmh,
            accuracy_m: 5.0,
            raw_valid: true,
        }
    }

    fn sampler() -> SamplingController {
        SamplingController::new(SamplingConfig::default())
    }

    #[test]
    fn test_first_point_always_stored() {
        assert_eq!(sampler().decide(None, &candidate(0.0, 0, 0.0)), SampleDecision::Store);
    }

    #[test]
    fn test_distance_floor_depends_on_speed() {
        let s = sampler();
        let last = last();
        // 6.5 m at walking pace: below the 8 m floor
        assert_eq!(s.decide(Some(&last), &candidate(6.5, 1000, 4.0)), SampleDecision::Skip);
        // Same distance when moving: above the 5 m floor
        assert_eq!(s.decide(Some(&last), &candidate(6.5, 1000, 20.0)), SampleDecision::Store);
    }

    #[test]
    fn test_elapsed_time_forces_store() {
        let s = sampler();
        let last = last();
        assert_eq!(s.decide(Some(&last), &candidate(2.0, 5000, 4.0)), SampleDecision::Skip);
        assert_eq!(s.decide(Some(&last), &candidate(2.0, 5001, 4.0)), SampleDecision::Store);
    }

    #[test]
    fn test_implausible_speed_skipped() {
        let s = sampler();
        assert_eq!(s.decide(Some(&last()), &candidate(100.0, 1000, 450.0)), SampleDecision::Skip);
        assert_eq!(s.decide(None, &candidate(0.0, 0, 450.0)), SampleDecision::Skip);
    }
}
