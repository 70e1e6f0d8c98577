//! Route simplification and encoding
//!
//! Douglas-Peucker runs per segment with a tolerance picked from recent
//! speed, and the kept points are encoded as a polyline. Runs are throttled
//! by trace size so long trips do not re-simplify on every point.

use crate::domain::geo;
use crate::domain::types::{SegmentIndex, TrackPoint};
use crate::infra::config::SimplifierConfig;
use crate::infra::metrics::Metrics;
use crate::io::polyline;
use smallvec::{smallvec, SmallVec};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, warn};

/// Raw storage cost of one coordinate pair (two f64)
const RAW_POINT_BYTES: f64 = 16.0;

#[derive(Debug, Clone, PartialEq)]
pub struct SimplifiedTrace {
    /// Log indices of the kept points
    pub indices: Vec<usize>,
    pub polyline: String,
    pub tolerance_m: f64,
    /// Kept / original point count
    pub ratio: f64,
    /// Polyline bytes / raw coordinate bytes
    pub compression: f64,
}

impl SimplifiedTrace {
    fn empty() -> Self {
        Self { indices: Vec::new(), polyline: String::new(), tolerance_m: 0.0, ratio: 1.0, compression: 0.0 }
    }
}

pub struct Simplifier {
    config: SimplifierConfig,
    metrics: Arc<Metrics>,
    latest: Option<SimplifiedTrace>,
}

impl Simplifier {
    pub fn new(config: SimplifierConfig, metrics: Arc<Metrics>) -> Self {
        Self { config, metrics, latest: None }
    }

    /// Cadence for a trace of `len` points
    pub fn interval_for(&self, len: usize) -> usize {
        self.config
            .tiers
            .iter()
            .find(|tier| len < tier.below)
            .map(|tier| tier.every)
            .unwrap_or(self.config.every_beyond)
            .max(1)
    }

    pub fn should_run(&self, len: usize) -> bool {
        len > 0 && len % self.interval_for(len) == 0
    }

    /// Tolerance from the average speed of the most recent points
    pub fn tolerance_for(&self, points: &[TrackPoint]) -> f64 {
        let window = self.config.speed_window.max(1);
        let recent = &points[points.len().saturating_sub(window)..];
        if recent.is_empty() {
            return self.config.tolerance_slow_m;
        }
        let avg_kmh = recent.iter().map(|p| p.speed_kmh).sum::<f64>() / recent.len() as f64;

        if avg_kmh < self.config.slow_below_kmh {
            self.config.tolerance_slow_m
        } else if avg_kmh <= self.config.fast_above_kmh {
            self.config.tolerance_mid_m
        } else {
            self.config.tolerance_fast_m
        }
    }

    /// Simplify every segment and encode the result
    pub fn simplify(
        &self,
        points: &[TrackPoint],
        ranges: &[(SegmentIndex, Range<usize>)],
    ) -> SimplifiedTrace {
        if points.is_empty() {
            return SimplifiedTrace::empty();
        }

        let tolerance_m = self.tolerance_for(points);
        let mut indices = Vec::new();
        for (_, range) in ranges {
            let segment = &points[range.clone()];
            indices.extend(simplify_indices(segment, tolerance_m).into_iter().map(|i| i + range.start));
        }

        // First and last point of the whole trace are always kept
        if indices.first() != Some(&0) {
            indices.insert(0, 0);
        }
        let last = points.len() - 1;
        if indices.last() != Some(&last) {
            indices.push(last);
        }

        let polyline = polyline::encode(indices.iter().map(|&i| (points[i].latitude, points[i].longitude)))
            .unwrap_or_else(|e| {
                warn!(points = %indices.len(), error = %e, "polyline_encode_failed");
                String::new()
            });
        let ratio = indices.len() as f64 / points.len() as f64;
        let compression = polyline.len() as f64 / (points.len() as f64 * RAW_POINT_BYTES);

        SimplifiedTrace { indices, polyline, tolerance_m, ratio, compression }
    }

    /// Simplify if the throttle allows it for the current trace size
    pub fn maybe_run(
        &mut self,
        points: &[TrackPoint],
        ranges: &[(SegmentIndex, Range<usize>)],
    ) -> Option<&SimplifiedTrace> {
        if !self.should_run(points.len()) {
            return None;
        }
        Some(self.run(points, ranges))
    }

    /// Simplify unconditionally
    pub fn run(
        &mut self,
        points: &[TrackPoint],
        ranges: &[(SegmentIndex, Range<usize>)],
    ) -> &SimplifiedTrace {
        let result = self.simplify(points, ranges);
        self.metrics.record_simplification(result.ratio, result.compression);
        debug!(
            points = %points.len(),
            kept = %result.indices.len(),
            tolerance_m = %result.tolerance_m,
            "trace_simplified"
        );
        self.latest.insert(result)
    }

    pub fn latest(&self) -> Option<&SimplifiedTrace> {
        self.latest.as_ref()
    }

    pub fn reset(&mut self) {
        self.latest = None;
    }
}

/// Douglas-Peucker on one segment, returning kept indices into `points`
pub fn simplify_indices(points: &[TrackPoint], tolerance_m: f64) -> Vec<usize> {
    if points.len() <= 2 {
        return (0..points.len()).collect();
    }

    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[points.len() - 1] = true;

    // Explicit work stack; long segments would otherwise recurse deeply
    let mut ranges: SmallVec<[(usize, usize); 32]> = smallvec![(0, points.len() - 1)];
    while let Some((start, end)) = ranges.pop() {
        if end <= start + 1 {
            continue;
        }
        if let Some(split) = farthest_beyond(points, start, end, tolerance_m) {
            keep[split] = true;
            ranges.push((start, split));
            ranges.push((split, end));
        }
    }

    keep.iter().enumerate().filter_map(|(i, &k)| k.then_some(i)).collect()
}

/// Interior point of `start..end` farthest from the chord, if beyond tolerance
fn farthest_beyond(points: &[TrackPoint], start: usize, end: usize, tolerance_m: f64) -> Option<usize> {
    let a = (points[start].latitude, points[start].longitude);
    let b = (points[end].latitude, points[end].longitude);

    let mut max_distance = 0.0;
    let mut max_index = start;
    for (offset, p) in points[start + 1..end].iter().enumerate() {
        let d = geo::perpendicular_distance_m((p.latitude, p.longitude), a, b);
        if d > max_distance {
            max_distance = d;
            max_index = start + 1 + offset;
        }
    }

    (max_distance > tolerance_m).then_some(max_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::geo::offset_m;
    use crate::domain::types::PointFlags;

    fn point(north_m: f64, east_m: f64, speed_kmh: f64, segment: u32) -> TrackPoint {
        let (latitude, longitude) = offset_m(48.0, 2.0, north_m, east_m);
        TrackPoint {
            latitude,
            longitude,
            timestamp_ms: 0,
            speed_kmh,
            altitude_m: 0.0,
            heading_deg: 0.0,
            segment_index: SegmentIndex(segment),
            flags: PointFlags::default(),
        }
    }

    fn simplifier() -> Simplifier {
        Simplifier::new(SimplifierConfig::default(), Arc::new(Metrics::new()))
    }

    #[test]
    fn test_throttle_tiers() {
        let s = simplifier();
        assert_eq!(s.interval_for(10), 1);
        assert_eq!(s.interval_for(200), 5);
        assert_eq!(s.interval_for(4999), 10);
        assert_eq!(s.interval_for(5000), 20);

        assert!(s.should_run(199));
        assert!(!s.should_run(201));
        assert!(s.should_run(205));
        assert!(s.should_run(6000));
        assert!(!s.should_run(6010));
        assert!(!s.should_run(0));
    }

    #[test]
    fn test_tolerance_from_recent_speed() {
        let s = simplifier();
        let slow: Vec<_> = (0..10).map(|i| point(i as f64, 0.0, 20.0, 0)).collect();
        let mid: Vec<_> = (0..10).map(|i| point(i as f64, 0.0, 80.0, 0)).collect();
        let fast: Vec<_> = (0..10).map(|i| point(i as f64, 0.0, 130.0, 0)).collect();
        assert_eq!(s.tolerance_for(&slow), 1.0);
        assert_eq!(s.tolerance_for(&mid), 3.0);
        assert_eq!(s.tolerance_for(&fast), 5.0);
    }

    #[test]
    fn test_straight_line_collapses() {
        let points: Vec<_> = (0..20).map(|i| point(i as f64 * 10.0, 0.0, 20.0, 0)).collect();
        assert_eq!(simplify_indices(&points, 1.0), vec![0, 19]);
    }

    #[test]
    fn test_corner_is_kept() {
        let mut points: Vec<_> = (0..10).map(|i| point(i as f64 * 10.0, 0.0, 20.0, 0)).collect();
        points.extend((1..10).map(|i| point(90.0, i as f64 * 10.0, 20.0, 0)));
        let kept = simplify_indices(&points, 1.0);
        assert_eq!(kept, vec![0, 9, 18]);
    }

    #[test]
    fn test_segments_simplified_independently() {
        let s = simplifier();
        let mut points: Vec<_> = (0..5).map(|i| point(i as f64 * 10.0, 0.0, 20.0, 0)).collect();
        points.extend((0..5).map(|i| point(500.0, i as f64 * 10.0, 20.0, 1)));
        let ranges = vec![(SegmentIndex(0), 0..5), (SegmentIndex(1), 5..10)];

        let result = s.simplify(&points, &ranges);
        // Endpoints of both segments, never a line bridging the pause
        assert_eq!(result.indices, vec![0, 4, 5, 9]);
        assert!(result.indices.len() <= points.len());
        assert!((result.ratio - 0.4).abs() < 1e-9);

        let decoded = polyline::decode(&result.polyline).unwrap();
        assert_eq!(decoded.len(), 4);
        assert!((decoded[0].0 - points[0].latitude).abs() <= 1e-5);
        assert!((decoded[3].1 - points[9].longitude).abs() <= 1e-5);
    }

    #[test]
    fn test_run_records_metrics() {
        let metrics = Arc::new(Metrics::new());
        let mut s = Simplifier::new(SimplifierConfig::default(), metrics.clone());
        let points: Vec<_> = (0..3).map(|i| point(i as f64 * 10.0, 0.0, 20.0, 0)).collect();
        let ranges = vec![(SegmentIndex(0), 0..3)];

        assert!(s.maybe_run(&points, &ranges).is_some());
        assert_eq!(metrics.simplifier_runs(), 1);
        assert_eq!(s.latest().map(|r| r.indices.len()), Some(2));

        s.reset();
        assert!(s.latest().is_none());
    }
}
