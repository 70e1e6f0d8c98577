//! Confirmation buffer for suspicious candidates
//!
//! Points flagged as suspicious by the validator wait here. If a later
//! candidate continues the direction the buffered points describe, the
//! whole buffer is promoted into the trace; otherwise entries age out.

use crate::domain::geo;
use crate::domain::types::{TrackPoint, ValidationOutcome};
use crate::services::validator::Candidate;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfirmationBufferEntry {
    pub candidate: Candidate,
    pub outcome: ValidationOutcome,
    pub arrival_ms: u64,
}

pub struct ConfirmationBuffer {
    entries: VecDeque<ConfirmationBufferEntry>,
    capacity: usize,
    max_bearing_delta_deg: f64,
}

impl ConfirmationBuffer {
    pub fn new(capacity: usize, max_bearing_delta_deg: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            max_bearing_delta_deg,
        }
    }

    /// Hold a suspicious candidate. Returns the number of entries evicted.
    pub fn push(&mut self, entry: ConfirmationBufferEntry) -> usize {
        self.entries.push_back(entry);
        let mut evicted = 0;
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Bearing the buffered points describe: first→last entry, or
    /// last stored point → the single entry.
    fn trend_bearing(&self, last_stored: Option<&TrackPoint>) -> Option<f64> {
        let newest = self.entries.back()?;
        let (from_lat, from_lon) = if self.entries.len() >= 2 {
            let first = self.entries.front()?;
            (first.candidate.latitude, first.candidate.longitude)
        } else {
            let stored = last_stored?;
            (stored.latitude, stored.longitude)
        };

        let leg_m = geo::haversine_m(
            from_lat,
            from_lon,
            newest.candidate.latitude,
            newest.candidate.longitude,
        );
        if leg_m < 1.0 {
            return None;
        }
        Some(geo::bearing_deg(from_lat, from_lon, newest.candidate.latitude, newest.candidate.longitude))
    }

    /// True when `next` continues the buffered trend
    pub fn confirms(&self, next: &Candidate, last_stored: Option<&TrackPoint>) -> bool {
        let Some(trend) = self.trend_bearing(last_stored) else {
            return false;
        };
        let Some(newest) = self.entries.back() else {
            return false;
        };
        if geo::haversine_m(newest.candidate.latitude, newest.candidate.longitude, next.latitude, next.longitude)
            < 1.0
        {
            return false;
        }
        let bearing = geo::bearing_deg(
            newest.candidate.latitude,
            newest.candidate.longitude,
            next.latitude,
            next.longitude,
        );
        geo::bearing_delta_deg(trend, bearing) <= self.max_bearing_delta_deg
    }

    /// Take every buffered entry in arrival order
    pub fn promote(&mut self) -> Vec<ConfirmationBufferEntry> {
        self.entries.drain(..).collect()
    }

    /// Drop entries that can no longer be appended after a point at `timestamp_ms`
    pub fn drop_older_than(&mut self, timestamp_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.candidate.timestamp_ms > timestamp_ms);
        before - self.entries.len()
    }

    /// Returns the number of entries discarded
    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ConfirmationBufferEntry> {
        self.entries.iter()
    }
}
