//! Crash-resilient trace persistence
//!
//! The point log is written twice (`trace.primary` and `trace.backup`) next
//! to the segment boundaries, estimated stretches, altitudes, statistics and
//! session timers. Writes during ingestion are throttled; writes at state
//! transitions are forced and retried with a short backoff.

use crate::domain::types::{EndReason, PointFlags, RawFix, SegmentIndex, TrackPoint};
use crate::infra::config::PersistenceConfig;
use crate::infra::metrics::Metrics;
use crate::io::store::{KeyValueStore, StoreError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub mod keys {
    pub const TRACE_PRIMARY: &str = "trace.primary";
    pub const TRACE_BACKUP: &str = "trace.backup";
    pub const TRACE_SEGMENTS: &str = "trace.segments";
    pub const TRACE_LAST_FIX_TS: &str = "trace.last_fix_ts";
    pub const TRACE_ESTIMATED: &str = "trace.estimated";
    pub const TRACE_ALTITUDES: &str = "trace.altitudes";
    pub const STATS_MAX_SPEED: &str = "stats.max_speed";
    pub const STATS_STOPS: &str = "stats.stops";
    pub const SESSION_STARTED_AT: &str = "session.started_at";
    pub const SESSION_ACCUMULATED_MS: &str = "session.accumulated_ms";
    pub const SESSION_PAUSED: &str = "session.paused";
    pub const SESSION_END_REASON: &str = "session.end_reason";
    pub const SOURCE_QUEUE: &str = "source.queue";

    /// Keys cleared when a session finishes
    pub const WORKING: [&str; 11] = [
        TRACE_PRIMARY,
        TRACE_BACKUP,
        TRACE_SEGMENTS,
        TRACE_LAST_FIX_TS,
        TRACE_ESTIMATED,
        TRACE_ALTITUDES,
        STATS_MAX_SPEED,
        STATS_STOPS,
        SESSION_STARTED_AT,
        SESSION_ACCUMULATED_MS,
        SESSION_PAUSED,
    ];
}

/// Both trace keys failed at a state transition
#[derive(Debug, Clone, Error, PartialEq)]
#[error("trace could not be persisted at {transition} after {attempts} attempts: {message}")]
pub struct PersistenceWarning {
    pub transition: &'static str,
    pub attempts: u32,
    pub message: String,
}

/// Persisted form of a point. Altitude lives under its own key and
/// `segment_index` is missing in logs written by older versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPoint {
    latitude: f64,
    longitude: f64,
    timestamp_ms: u64,
    #[serde(default)]
    speed_kmh: f64,
    #[serde(default)]
    heading_deg: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    segment_index: Option<u32>,
    #[serde(default)]
    flags: PointFlags,
}

impl From<&TrackPoint> for StoredPoint {
    fn from(p: &TrackPoint) -> Self {
        Self {
            latitude: p.latitude,
            longitude: p.longitude,
            timestamp_ms: p.timestamp_ms,
            speed_kmh: p.speed_kmh,
            heading_deg: p.heading_deg,
            segment_index: Some(p.segment_index.0),
            flags: p.flags,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
struct StopStats {
    count: u32,
    time_ms: u64,
}

/// Everything needed to write one consistent snapshot
#[derive(Debug, Clone, Copy)]
pub struct TraceSnapshot<'a> {
    pub points: &'a [TrackPoint],
    pub segment_starts: &'a [usize],
    pub estimated: &'a [usize],
    pub last_fix_ts: Option<u64>,
    pub max_speed_kmh: f64,
    pub stop_count: u32,
    pub stop_time_ms: u64,
    pub started_at_ms: Option<u64>,
    pub accumulated_ms: u64,
    pub paused: bool,
}

/// Serialized key/value pairs of a snapshot
struct EncodedSnapshot {
    trace: String,
    extras: Vec<(&'static str, String)>,
}

/// Where the restored point log came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreSource {
    /// Nothing was persisted
    Fresh,
    Primary,
    Backup,
    /// Data existed but neither copy was readable
    DataLoss,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoredState {
    pub source: RestoreSource,
    pub points: Vec<TrackPoint>,
    pub segment_starts: Vec<usize>,
    pub estimated: Vec<usize>,
    pub last_fix_ts: Option<u64>,
    pub max_speed_kmh: f64,
    pub stop_count: u32,
    pub stop_time_ms: u64,
    pub started_at_ms: Option<u64>,
    pub accumulated_ms: u64,
    pub paused: bool,
    pub end_reason: EndReason,
}

pub struct TracePersistence {
    store: Arc<dyn KeyValueStore>,
    config: PersistenceConfig,
    metrics: Arc<Metrics>,
}

fn to_json<T: Serialize + ?Sized>(key: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value)
        .map_err(|source| StoreError::Serialize { key: key.to_string(), source })
}

impl TracePersistence {
    pub fn new(store: Arc<dyn KeyValueStore>, config: PersistenceConfig, metrics: Arc<Metrics>) -> Self {
        Self { store, config, metrics }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Throttle rule for writes during ingestion
    pub fn should_persist(&self, len: usize) -> bool {
        len < self.config.always_below || (self.config.throttle_every > 0 && len % self.config.throttle_every == 0)
    }

    fn encode(&self, snap: &TraceSnapshot<'_>) -> Result<EncodedSnapshot, StoreError> {
        let stored: Vec<StoredPoint> = snap.points.iter().map(StoredPoint::from).collect();
        let altitudes: Vec<f64> = snap.points.iter().map(|p| p.altitude_m).collect();
        let stops = StopStats { count: snap.stop_count, time_ms: snap.stop_time_ms };

        Ok(EncodedSnapshot {
            trace: to_json(keys::TRACE_PRIMARY, &stored)?,
            extras: vec![
                (keys::TRACE_SEGMENTS, to_json(keys::TRACE_SEGMENTS, snap.segment_starts)?),
                (keys::TRACE_LAST_FIX_TS, to_json(keys::TRACE_LAST_FIX_TS, &snap.last_fix_ts)?),
                (keys::TRACE_ESTIMATED, to_json(keys::TRACE_ESTIMATED, snap.estimated)?),
                (keys::TRACE_ALTITUDES, to_json(keys::TRACE_ALTITUDES, &altitudes)?),
                (keys::STATS_MAX_SPEED, to_json(keys::STATS_MAX_SPEED, &snap.max_speed_kmh)?),
                (keys::STATS_STOPS, to_json(keys::STATS_STOPS, &stops)?),
                (keys::SESSION_STARTED_AT, to_json(keys::SESSION_STARTED_AT, &snap.started_at_ms)?),
                (keys::SESSION_ACCUMULATED_MS, to_json(keys::SESSION_ACCUMULATED_MS, &snap.accumulated_ms)?),
                (keys::SESSION_PAUSED, to_json(keys::SESSION_PAUSED, &snap.paused)?),
            ],
        })
    }

    /// One write attempt. Succeeds when at least one trace copy landed.
    fn write(&self, encoded: &EncodedSnapshot) -> Result<(), StoreError> {
        let primary = self.store.set(keys::TRACE_PRIMARY, &encoded.trace);
        let backup = self.store.set(keys::TRACE_BACKUP, &encoded.trace);

        for (key, value) in &encoded.extras {
            if let Err(e) = self.store.set(key, value) {
                warn!(key = %key, error = %e, "persist_key_failed");
            }
        }

        match (primary, backup) {
            (Err(e), Err(_)) => Err(e),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => {
                warn!(error = %e, "trace_copy_failed");
                Ok(())
            }
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    /// Write if the throttle allows it. Failures are logged and counted.
    pub fn persist_throttled(&self, snap: &TraceSnapshot<'_>) -> bool {
        if !self.should_persist(snap.points.len()) {
            return false;
        }
        let result = self.encode(snap).and_then(|encoded| self.write(&encoded));
        match result {
            Ok(()) => {
                self.metrics.record_persist_write();
                debug!(points = %snap.points.len(), "trace_persisted");
                true
            }
            Err(e) => {
                self.metrics.record_persist_failure();
                warn!(points = %snap.points.len(), error = %e, "trace_persist_failed");
                false
            }
        }
    }

    /// Write now, retrying with backoff
    pub async fn persist_forced(
        &self,
        snap: &TraceSnapshot<'_>,
        transition: &'static str,
    ) -> Result<(), PersistenceWarning> {
        let encoded = self.encode(snap).map_err(|e| PersistenceWarning {
            transition,
            attempts: 0,
            message: e.to_string(),
        })?;

        let attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.write(&encoded) {
                Ok(()) => {
                    self.metrics.record_persist_write();
                    info!(
                        points = %snap.points.len(),
                        transition = %transition,
                        attempt = %attempt,
                        "trace_persisted"
                    );
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(transition = %transition, attempt = %attempt, error = %e, "trace_persist_retry");
                    if attempt < attempts {
                        self.metrics.record_persist_retry();
                        tokio::time::sleep(Duration::from_millis(self.config.backoff_ms * attempt as u64)).await;
                    }
                }
            }
        }

        self.metrics.record_persist_failure();
        error!(transition = %transition, attempts = %attempts, error = %last_error, "trace_persist_exhausted");
        Err(PersistenceWarning { transition, attempts, message: last_error })
    }

    fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.store.get(key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| StoreError::Corrupt { key: key.to_string(), source }),
            None => Ok(None),
        }
    }

    /// Read an auxiliary key, treating unreadable values as absent
    fn read_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        match self.read_json(key) {
            Ok(Some(value)) => value,
            Ok(None) => T::default(),
            Err(e) => {
                warn!(key = %key, error = %e, "persisted_key_unreadable");
                T::default()
            }
        }
    }

    fn read_trace(&self) -> (RestoreSource, Vec<StoredPoint>) {
        let mut existed = false;
        for (key, source) in [(keys::TRACE_PRIMARY, RestoreSource::Primary), (keys::TRACE_BACKUP, RestoreSource::Backup)] {
            match self.read_json::<Vec<StoredPoint>>(key) {
                Ok(Some(points)) => {
                    if source == RestoreSource::Backup {
                        self.metrics.record_restore_fallback();
                        warn!(points = %points.len(), "trace_restore_from_backup");
                    }
                    return (source, points);
                }
                Ok(None) => {}
                Err(e) => {
                    existed = true;
                    warn!(key = %key, error = %e, "trace_copy_unreadable");
                }
            }
        }

        if existed {
            self.metrics.record_restore_fallback();
            error!("trace_restore_data_loss");
            (RestoreSource::DataLoss, Vec::new())
        } else {
            (RestoreSource::Fresh, Vec::new())
        }
    }

    /// Rebuild the persisted session: primary, then backup, then empty
    pub fn restore(&self) -> RestoredState {
        let (source, stored) = self.read_trace();

        let mut segment_starts: Vec<usize> = self.read_or_default(keys::TRACE_SEGMENTS);
        if segment_starts.first() != Some(&0) {
            segment_starts.insert(0, 0);
        }
        let altitudes: Vec<f64> = self.read_or_default(keys::TRACE_ALTITUDES);
        let altitudes_aligned = altitudes.len() == stored.len();

        let points: Vec<TrackPoint> = stored
            .into_iter()
            .enumerate()
            .map(|(i, p)| {
                let segment_index = p.segment_index.unwrap_or_else(|| {
                    segment_starts.partition_point(|&start| start <= i).saturating_sub(1) as u32
                });
                TrackPoint {
                    latitude: p.latitude,
                    longitude: p.longitude,
                    timestamp_ms: p.timestamp_ms,
                    speed_kmh: p.speed_kmh,
                    altitude_m: if altitudes_aligned { altitudes[i] } else { 0.0 },
                    heading_deg: p.heading_deg,
                    segment_index: SegmentIndex(segment_index),
                    flags: p.flags,
                }
            })
            .collect();

        let stops: StopStats = self.read_or_default(keys::STATS_STOPS);
        let end_reason = self
            .store
            .get(keys::SESSION_END_REASON)
            .ok()
            .flatten()
            .and_then(|raw| EndReason::parse(&raw))
            .unwrap_or_default();

        RestoredState {
            source,
            points,
            segment_starts,
            estimated: self.read_or_default(keys::TRACE_ESTIMATED),
            last_fix_ts: self.read_or_default(keys::TRACE_LAST_FIX_TS),
            max_speed_kmh: self.read_or_default(keys::STATS_MAX_SPEED),
            stop_count: stops.count,
            stop_time_ms: stops.time_ms,
            started_at_ms: self.read_or_default(keys::SESSION_STARTED_AT),
            accumulated_ms: self.read_or_default(keys::SESSION_ACCUMULATED_MS),
            paused: self.read_or_default(keys::SESSION_PAUSED),
            end_reason,
        }
    }

    pub fn save_end_reason(&self, reason: EndReason) -> Result<(), StoreError> {
        self.store.set(keys::SESSION_END_REASON, reason.as_str())
    }

    /// Remove every working key. The end reason stays so relaunch can tell
    /// a finished trip from a crashed one.
    pub fn clear_working(&self) {
        for key in keys::WORKING {
            if let Err(e) = self.store.remove(key) {
                warn!(key = %key, error = %e, "persist_clear_failed");
            }
        }
    }

    /// Fixes the location source queued while the app was backgrounded
    pub fn load_source_queue(&self) -> Vec<RawFix> {
        self.read_or_default(keys::SOURCE_QUEUE)
    }

    pub fn append_source_queue(&self, fixes: &[RawFix]) -> Result<(), StoreError> {
        let mut queue = self.load_source_queue();
        queue.extend_from_slice(fixes);
        self.store.set(keys::SOURCE_QUEUE, &to_json(keys::SOURCE_QUEUE, &queue)?)
    }

    pub fn clear_source_queue(&self) -> Result<(), StoreError> {
        self.store.remove(keys::SOURCE_QUEUE)
    }
}
