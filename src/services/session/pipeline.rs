//! Fix ingestion pipeline
//!
//! raw fix -> gap handling -> smoother -> confirmation buffer -> validator
//! -> sampler -> segment append -> throttled persistence and simplification

use super::Session;
use crate::domain::geo;
use crate::domain::types::{PointFlags, RawFix, RejectReason, SessionStatus, TrackPoint};
use crate::services::confirmation::ConfirmationBufferEntry;
use crate::services::sampler::SampleDecision;
use crate::services::segments::PointDraft;
use crate::services::validator::Candidate;
use std::time::Instant;
use tracing::{debug, info};

/// What happened to the fix itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Not recording, or older than the previous fix
    Ignored,
    Rejected(RejectReason),
    /// Held in the confirmation buffer
    Deferred(RejectReason),
    /// Valid but too close to the last stored point
    SampledOut,
    /// Appended at this log index
    Stored { index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestResult {
    pub outcome: IngestOutcome,
    /// Buffered points promoted into the trace by this fix
    pub promoted: usize,
    /// Points synthesized to fill a short gap before this fix
    pub interpolated: usize,
}

impl IngestResult {
    fn new(outcome: IngestOutcome) -> Self {
        Self { outcome, promoted: 0, interpolated: 0 }
    }
}

impl Session {
    /// Run one raw fix through the pipeline
    pub fn ingest(&mut self, fix: RawFix) -> IngestResult {
        if self.state.status != SessionStatus::Running {
            return IngestResult::new(IngestOutcome::Ignored);
        }
        if self.last_fix_ts.is_some_and(|last| fix.timestamp_ms < last) {
            debug!(timestamp_ms = %fix.timestamp_ms, "fix_out_of_order");
            return IngestResult::new(IngestOutcome::Ignored);
        }

        let process_start = Instant::now();
        self.fixes_received += 1;
        let result = self.process_fix(fix);

        let latency_us = process_start.elapsed().as_micros() as u64;
        self.metrics.record_fix_processed(latency_us);
        result
    }

    fn process_fix(&mut self, fix: RawFix) -> IngestResult {
        let raw_valid = geo::is_valid_coordinate(fix.latitude, fix.longitude);
        let speed_kmh = self.speed.estimate(fix.speed_mps);
        let mut interpolated = 0;

        if let Some(last_ts) = self.last_fix_ts {
            let gap_ms = fix.timestamp_ms - last_ts;
            if gap_ms > self.gaps.long_gap_ms {
                self.handle_signal_loss(gap_ms);
            } else if gap_ms >= self.gaps.short_gap_ms {
                let raw = candidate_from(&fix, fix.latitude, fix.longitude, speed_kmh, raw_valid);
                interpolated = self.fill_gap(&raw, gap_ms);
            }
        }
        self.last_fix_ts = Some(fix.timestamp_ms);

        let rollback = self.smoother.snapshot();
        let (latitude, longitude) = self.smoother.smooth(fix.latitude, fix.longitude, fix.timestamp_ms);
        let candidate = candidate_from(&fix, latitude, longitude, speed_kmh, raw_valid);

        let promoted = self.try_promote(&candidate);

        let outcome = self.validator.validate(self.segments.validation_window(), &candidate);
        let outcome_kind = if outcome.accepted {
            self.max_speed.update(candidate.speed_kmh, candidate.timestamp_ms);
            match self.sampler.decide(self.segments.last_point(), &candidate) {
                SampleDecision::Store => {
                    let index = self.append_point(&candidate, PointFlags::default());
                    let stale = self.buffer.drop_older_than(candidate.timestamp_ms);
                    if stale > 0 {
                        self.metrics.record_buffer_dropped(stale);
                    }
                    IngestOutcome::Stored { index }
                }
                SampleDecision::Skip => {
                    self.points_sampled_out += 1;
                    self.metrics.record_sampled_out();
                    IngestOutcome::SampledOut
                }
            }
        } else {
            // Rejected points must not drag the filter
            self.smoother.restore(rollback);
            let reason = outcome.reason.unwrap_or(RejectReason::InvalidCoordinates);

            if outcome.is_suspicious() {
                let evicted = self.buffer.push(ConfirmationBufferEntry {
                    candidate,
                    outcome,
                    arrival_ms: self.clock.now_ms(),
                });
                self.metrics.record_buffered();
                if evicted > 0 {
                    self.metrics.record_buffer_dropped(evicted);
                }
                debug!(
                    reason = %reason,
                    distance_m = format!("{:.1}", outcome.measured_distance_m),
                    bearing_delta_deg = format!("{:.0}", outcome.bearing_delta_deg),
                    buffered = %self.buffer.len(),
                    "point_deferred"
                );
                IngestOutcome::Deferred(reason)
            } else {
                self.points_rejected += 1;
                self.metrics.record_rejected(reason);
                debug!(
                    reason = %reason,
                    distance_m = format!("{:.1}", outcome.measured_distance_m),
                    speed_kmh = format!("{:.1}", outcome.measured_speed_kmh),
                    "point_rejected"
                );
                IngestOutcome::Rejected(reason)
            }
        };

        IngestResult { outcome: outcome_kind, promoted, interpolated }
    }

    /// Append every buffered point when `next` continues their trend
    fn try_promote(&mut self, next: &Candidate) -> usize {
        if self.buffer.is_empty() || !self.buffer.confirms(next, self.segments.last_point()) {
            return 0;
        }
        if !self.validator.can_confirm(self.segments.validation_window(), next) {
            debug!(buffered = %self.buffer.len(), "buffer_confirmation_refused");
            return 0;
        }

        let entries = self.buffer.promote();
        for entry in &entries {
            self.max_speed.update(entry.candidate.speed_kmh, entry.candidate.timestamp_ms);
            self.append_point(&entry.candidate, PointFlags::default());
        }
        self.metrics.record_promoted(entries.len());
        debug!(count = %entries.len(), "buffer_promoted");
        entries.len()
    }

    /// Long silence: the trace continues as an estimated stretch and
    /// validation restarts at the next point
    fn handle_signal_loss(&mut self, gap_ms: u64) {
        self.segments.mark_signal_loss();
        let dropped = self.buffer.clear();
        if dropped > 0 {
            self.metrics.record_buffer_dropped(dropped);
        }
        self.metrics.record_estimated_stretch();
        info!(gap_ms = %gap_ms, points = %self.segments.len(), "signal_lost");
    }

    /// Short silence: synthesize points on the line from the last stored
    /// point to the new fix. Returns how many were appended.
    fn fill_gap(&mut self, raw: &Candidate, gap_ms: u64) -> usize {
        let Some(anchor) = self.segments.last_point().copied() else {
            return 0;
        };
        if self.validator.blocks_interpolation(self.segments.validation_window(), raw) {
            debug!(gap_ms = %gap_ms, "gap_not_interpolated");
            return 0;
        }

        let count = ((gap_ms / 1000).saturating_sub(1) as usize).min(self.gaps.max_interpolated).max(1);
        let span_ms = raw.timestamp_ms.saturating_sub(anchor.timestamp_ms);
        let distance_m = geo::haversine_m(anchor.latitude, anchor.longitude, raw.latitude, raw.longitude);
        let speed_kmh = if span_ms > 0 { distance_m / (span_ms as f64 / 1000.0) * 3.6 } else { 0.0 };

        for i in 1..=count {
            let t = i as f64 / (count + 1) as f64;
            let (lat, lon) =
                geo::lerp_coordinate((anchor.latitude, anchor.longitude), (raw.latitude, raw.longitude), t);
            let timestamp_ms = anchor.timestamp_ms + span_ms * i as u64 / (count as u64 + 1);
            let (latitude, longitude) = self.smoother.smooth(lat, lon, timestamp_ms);
            let altitude_m = anchor.altitude_m + (raw.altitude_m - anchor.altitude_m) * t;

            let draft = Candidate { latitude, longitude, timestamp_ms, altitude_m, speed_kmh, ..*raw };
            self.append_point(&draft, PointFlags::interpolated());
        }

        self.points_interpolated += count as u64;
        self.metrics.record_interpolated(count);
        debug!(gap_ms = %gap_ms, count = %count, "gap_interpolated");
        count
    }

    /// Append to the log, then give persistence and the simplifier their turn
    fn append_point(&mut self, candidate: &Candidate, flags: PointFlags) -> usize {
        let index = self.segments.append(PointDraft {
            latitude: candidate.latitude,
            longitude: candidate.longitude,
            timestamp_ms: candidate.timestamp_ms,
            speed_kmh: candidate.speed_kmh,
            altitude_m: candidate.altitude_m,
            flags,
        });
        self.metrics.record_point_stored();

        let now = self.clock.now_ms();
        self.persistence.persist_throttled(&self.trace_snapshot(now));

        let ranges = self.segments.segment_ranges();
        self.simplifier.maybe_run(self.segments.points(), &ranges);
        index
    }

    /// Last stored point of the current segment
    pub fn last_point(&self) -> Option<&TrackPoint> {
        self.segments.last_point()
    }
}

fn candidate_from(fix: &RawFix, latitude: f64, longitude: f64, speed_kmh: f64, raw_valid: bool) -> Candidate {
    Candidate {
        latitude,
        longitude,
        timestamp_ms: fix.timestamp_ms,
        altitude_m: fix.altitude,
        speed_kmh,
        reported_speed_kmh: fix.reported_speed_kmh(),
        accuracy_m: fix.accuracy_m,
        raw_valid,
    }
}
