//! Append-only point log with pause-aware segmentation
//!
//! A segment is the run of points between a resume and the next pause. The
//! log also tracks a trust boundary (validation restarts there after a long
//! signal loss) and the estimated stretches such losses leave behind.

use crate::domain::geo;
use crate::domain::types::{PointFlags, SegmentIndex, TrackPoint};
use std::ops::Range;
use tracing::debug;

/// What is needed to append a point; the manager fills in segment and heading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointDraft {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp_ms: u64,
    pub speed_kmh: f64,
    pub altitude_m: f64,
    pub flags: PointFlags,
}

pub struct SegmentManager {
    points: Vec<TrackPoint>,
    /// Start offset of each segment; index = segment index
    segment_starts: Vec<usize>,
    /// Validation restarts at this log offset
    trust_boundary: usize,
    /// Indices of the last point before each long signal loss
    estimated: Vec<usize>,
    /// Next appended point opens a segment after a pause
    pending_stop_marker: bool,
    distance_m: f64,
    moving_ms: u64,
}

impl SegmentManager {
    pub fn new() -> Self {
        Self {
            points: Vec::new(),
            segment_starts: vec![0],
            trust_boundary: 0,
            estimated: Vec::new(),
            pending_stop_marker: false,
            distance_m: 0.0,
            moving_ms: 0,
        }
    }

    pub fn current_segment(&self) -> SegmentIndex {
        SegmentIndex(self.segment_starts.len().saturating_sub(1) as u32)
    }

    fn current_start(&self) -> usize {
        self.segment_starts.last().copied().unwrap_or(0)
    }

    /// Begin a new segment at the current log length
    pub fn open_segment(&mut self) -> SegmentIndex {
        let offset = self.points.len();
        self.segment_starts.push(offset);
        self.trust_boundary = offset;
        self.pending_stop_marker = true;
        let index = self.current_segment();
        debug!(segment = %index, offset = %offset, "segment_opened");
        index
    }

    /// Record a long signal loss: the last point starts an estimated
    /// stretch and validation restarts at the next point
    pub fn mark_signal_loss(&mut self) {
        if self.last_point().is_some() {
            let last = self.points.len() - 1;
            if self.estimated.last() != Some(&last) {
                self.estimated.push(last);
            }
        }
        self.trust_boundary = self.points.len();
    }

    /// Append a point to the current segment, returning its log index
    pub fn append(&mut self, draft: PointDraft) -> usize {
        let segment_index = self.current_segment();
        let previous = self.last_point().copied();

        let mut heading_deg = 0.0;
        if let Some(prev) = previous {
            let leg_m =
                geo::haversine_m(prev.latitude, prev.longitude, draft.latitude, draft.longitude);
            heading_deg = if leg_m >= 1.0 {
                geo::bearing_deg(prev.latitude, prev.longitude, draft.latitude, draft.longitude)
            } else {
                prev.heading_deg
            };
            self.distance_m += leg_m;
            self.moving_ms += draft.timestamp_ms.saturating_sub(prev.timestamp_ms);
        }

        let mut flags = draft.flags;
        if self.pending_stop_marker {
            flags.stop_marker = true;
            self.pending_stop_marker = false;
        }
        if self.in_estimated_stretch() {
            flags.estimated = true;
        }

        self.points.push(TrackPoint {
            latitude: draft.latitude,
            longitude: draft.longitude,
            timestamp_ms: draft.timestamp_ms,
            speed_kmh: draft.speed_kmh,
            altitude_m: draft.altitude_m,
            heading_deg,
            segment_index,
            flags,
        });
        self.points.len() - 1
    }

    /// True while the first point after a signal loss has not been appended yet
    fn in_estimated_stretch(&self) -> bool {
        self.trust_boundary == self.points.len()
            && self.estimated.last().is_some_and(|&i| i + 1 == self.points.len())
    }

    /// Last point of the current segment
    pub fn last_point(&self) -> Option<&TrackPoint> {
        if self.points.len() > self.current_start() {
            self.points.last()
        } else {
            None
        }
    }

    /// Points of the current segment after the trust boundary
    pub fn validation_window(&self) -> &[TrackPoint] {
        let start = self.current_start().max(self.trust_boundary).min(self.points.len());
        &self.points[start..]
    }

    pub fn points(&self) -> &[TrackPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn segment_starts(&self) -> &[usize] {
        &self.segment_starts
    }

    pub fn estimated(&self) -> &[usize] {
        &self.estimated
    }

    pub fn trust_boundary(&self) -> usize {
        self.trust_boundary
    }

    /// Log ranges of the non-empty segments, in order
    pub fn segment_ranges(&self) -> Vec<(SegmentIndex, Range<usize>)> {
        let mut out = Vec::with_capacity(self.segment_starts.len());
        for (i, &start) in self.segment_starts.iter().enumerate() {
            let end = self.segment_starts.get(i + 1).copied().unwrap_or(self.points.len());
            let end = end.min(self.points.len());
            if start < end {
                out.push((SegmentIndex(i as u32), start..end));
            }
        }
        out
    }

    /// Non-empty segments in order
    pub fn segments(&self) -> Vec<(SegmentIndex, &[TrackPoint])> {
        self.segment_ranges()
            .into_iter()
            .map(|(index, range)| (index, &self.points[range]))
            .collect()
    }

    /// Sum of distances between consecutive points of the same segment
    pub fn total_distance_m(&self) -> f64 {
        self.distance_m
    }

    /// Sum of time deltas between consecutive points of the same segment
    pub fn moving_duration_ms(&self) -> u64 {
        self.moving_ms
    }

    /// Rebuild from persisted state. Validation restarts after the restored log.
    pub fn restore(&mut self, points: Vec<TrackPoint>, segment_starts: Vec<usize>, estimated: Vec<usize>) {
        let mut starts: Vec<usize> =
            segment_starts.into_iter().filter(|&s| s <= points.len()).collect();
        if starts.first() != Some(&0) {
            starts.insert(0, 0);
        }
        // Offsets must never go backwards
        starts.dedup_by(|next, kept| next < kept);

        let (distance_m, moving_ms) = aggregate(&points);
        self.trust_boundary = points.len();
        self.estimated = estimated.into_iter().filter(|&i| i < points.len()).collect();
        self.points = points;
        self.segment_starts = starts;
        self.pending_stop_marker = false;
        self.distance_m = distance_m;
        self.moving_ms = moving_ms;
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for SegmentManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Distance and duration over consecutive same-segment pairs
pub fn aggregate(points: &[TrackPoint]) -> (f64, u64) {
    points
        .windows(2)
        .filter(|w| w[0].segment_index == w[1].segment_index)
        .fold((0.0, 0u64), |(d, t), w| {
            (
                d + geo::haversine_m(w[0].latitude, w[0].longitude, w[1].latitude, w[1].longitude),
                t + w[1].timestamp_ms.saturating_sub(w[0].timestamp_ms),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::geo::offset_m;

    fn draft(north_m: f64, ts_ms: u64) -> PointDraft {
        let (latitude, longitude) = offset_m(48.0, 2.0, north_m, 0.0);
        PointDraft {
            latitude,
            longitude,
            timestamp_ms: ts_ms,
            speed_kmh: 20.0,
            altitude_m: 0.0,
            flags: PointFlags::default(),
        }
    }

    #[test]
    fn test_append_computes_heading_and_distance() {
        let mut seg = SegmentManager::new();
        assert_eq!(seg.append(draft(0.0, 0)), 0);
        assert_eq!(seg.append(draft(10.0, 1000)), 1);

        let points = seg.points();
        assert_eq!(points[0].heading_deg, 0.0);
        assert!(points[1].heading_deg < 0.01 || points[1].heading_deg > 359.99);
        assert!((seg.total_distance_m() - 10.0).abs() < 0.1);
        assert_eq!(seg.moving_duration_ms(), 1000);
    }

    #[test]
    fn test_heading_kept_for_tiny_moves() {
        let mut seg = SegmentManager::new();
        seg.append(draft(0.0, 0));
        let (lat, lon) = offset_m(48.0, 2.0, 0.0, 10.0);
        seg.append(PointDraft { latitude: lat, longitude: lon, ..draft(0.0, 1000) });
        let (lat, lon) = offset_m(48.0, 2.0, 0.3, 10.0);
        seg.append(PointDraft { latitude: lat, longitude: lon, ..draft(0.0, 2000) });

        let points = seg.points();
        assert!((points[1].heading_deg - 90.0).abs() < 0.1);
        assert_eq!(points[2].heading_deg, points[1].heading_deg);
    }

    #[test]
    fn test_open_segment_boundaries_and_stop_marker() {
        let mut seg = SegmentManager::new();
        for i in 0..40u64 {
            seg.append(draft(i as f64 * 10.0, i * 1000));
        }
        let distance_before = seg.total_distance_m();

        assert_eq!(seg.open_segment(), SegmentIndex(1));
        assert_eq!(seg.segment_starts(), &[0, 40]);
        assert!(seg.last_point().is_none());
        assert!(seg.validation_window().is_empty());

        // Resume far away: no distance across the boundary
        seg.append(draft(5000.0, 100_000));
        assert_eq!(seg.total_distance_m(), distance_before);

        let p = seg.points()[40];
        assert_eq!(p.segment_index, SegmentIndex(1));
        assert!(p.flags.stop_marker);

        seg.append(draft(5010.0, 101_000));
        assert!(!seg.points()[41].flags.stop_marker);

        let segments = seg.segments();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].1.len(), 40);
        assert_eq!(segments[1].1.len(), 2);
    }

    #[test]
    fn test_signal_loss_moves_trust_boundary() {
        let mut seg = SegmentManager::new();
        seg.append(draft(0.0, 0));
        seg.append(draft(10.0, 1000));

        seg.mark_signal_loss();
        assert_eq!(seg.estimated(), &[1]);
        assert!(seg.validation_window().is_empty());
        // Still the same segment
        assert_eq!(seg.last_point().map(|p| p.timestamp_ms), Some(1000));

        seg.append(draft(400.0, 60_000));
        assert!(seg.points()[2].flags.estimated);
        assert_eq!(seg.points()[2].segment_index, SegmentIndex(0));
        assert_eq!(seg.validation_window().len(), 1);
    }

    #[test]
    fn test_restore_recomputes_aggregates() {
        let mut source = SegmentManager::new();
        source.append(draft(0.0, 0));
        source.append(draft(10.0, 1000));
        source.open_segment();
        source.append(draft(500.0, 50_000));
        source.append(draft(520.0, 52_000));

        let mut seg = SegmentManager::new();
        seg.restore(source.points().to_vec(), source.segment_starts().to_vec(), vec![]);

        assert_eq!(seg.len(), 4);
        assert_eq!(seg.current_segment(), SegmentIndex(1));
        assert!((seg.total_distance_m() - source.total_distance_m()).abs() < 1e-6);
        assert_eq!(seg.moving_duration_ms(), 3000);
        assert!(seg.validation_window().is_empty());
    }
}
