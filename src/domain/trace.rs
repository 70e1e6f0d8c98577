//! Read-only views of a recorded trip

use crate::domain::types::{EndReason, SegmentIndex, TrackPoint, TripStats};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Points of one segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentView {
    pub index: SegmentIndex,
    pub start_offset: usize,
    pub points: Vec<TrackPoint>,
}

/// Live view of the trace for rendering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceView {
    pub segments: Vec<SegmentView>,
    /// Log indices where an estimated stretch begins
    pub estimated: Vec<usize>,
    pub polyline: String,
    pub stats: TripStats,
}

impl TraceView {
    pub fn point_count(&self) -> usize {
        self.segments.iter().map(|s| s.points.len()).sum()
    }
}

/// Finished trip handed to egress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripSummary {
    pub trip_id: String,
    pub device_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: EndReason,
    pub stats: TripStats,
    pub segments: Vec<SegmentView>,
    pub estimated: Vec<usize>,
    pub polyline: String,
    pub simplified_points: usize,
    /// Persistence problems hit during the trip
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl TripSummary {
    /// Serialize to a single JSON line
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn point_count(&self) -> usize {
        self.segments.iter().map(|s| s.points.len()).sum()
    }
}

/// Epoch milliseconds to a UTC timestamp
pub fn to_datetime(epoch_ms: u64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(epoch_ms as i64).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::PointFlags;

    fn point(ts: u64) -> TrackPoint {
        TrackPoint {
            latitude: 48.0,
            longitude: 2.0,
            timestamp_ms: ts,
            speed_kmh: 0.0,
            altitude_m: 0.0,
            heading_deg: 0.0,
            segment_index: SegmentIndex(0),
            flags: PointFlags::default(),
        }
    }

    #[test]
    fn test_summary_json_line() {
        let summary = TripSummary {
            trip_id: "trip-1".to_string(),
            device_id: "bike".to_string(),
            started_at: to_datetime(1_700_000_000_000),
            ended_at: to_datetime(1_700_000_600_000),
            end_reason: EndReason::Completed,
            stats: TripStats::default(),
            segments: vec![SegmentView { index: SegmentIndex(0), start_offset: 0, points: vec![point(0), point(1000)] }],
            estimated: vec![],
            polyline: "_p~iF~ps|U".to_string(),
            simplified_points: 2,
            warnings: vec![],
        };

        let json = summary.to_json();
        assert!(!json.contains('\n'));
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["end_reason"], "completed");
        assert_eq!(parsed["started_at"], "2023-11-14T22:13:20Z");
        assert!(parsed.get("warnings").is_none());
        assert_eq!(summary.point_count(), 2);
    }
}
