//! Shared types for the trip recording core

use serde::{Deserialize, Serialize};

/// Newtype wrapper for segment indices to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SegmentIndex(pub u32);

impl SegmentIndex {
    #[inline]
    pub fn next(self) -> Self {
        SegmentIndex(self.0 + 1)
    }
}

impl std::fmt::Display for SegmentIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One raw measurement as delivered by the location service
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawFix {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: f64,
    /// Device-reported ground speed (m/s), may be negative when unknown
    #[serde(default)]
    pub speed_mps: f64,
    /// Horizontal accuracy radius (meters)
    #[serde(default)]
    pub accuracy_m: f64,
    pub timestamp_ms: u64,
    /// Satellites used in the fix, when the platform reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satellites: Option<u8>,
}

impl RawFix {
    pub fn new(latitude: f64, longitude: f64, timestamp_ms: u64) -> Self {
        Self {
            latitude,
            longitude,
            altitude: 0.0,
            speed_mps: 0.0,
            accuracy_m: 5.0,
            timestamp_ms,
            satellites: None,
        }
    }

    pub fn with_speed_mps(mut self, speed_mps: f64) -> Self {
        self.speed_mps = speed_mps;
        self
    }

    pub fn with_accuracy(mut self, accuracy_m: f64) -> Self {
        self.accuracy_m = accuracy_m;
        self
    }

    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = altitude;
        self
    }

    /// Device-reported speed in km/h, 0 when unknown
    #[inline]
    pub fn reported_speed_kmh(&self) -> f64 {
        if self.speed_mps.is_finite() && self.speed_mps > 0.0 {
            self.speed_mps * 3.6
        } else {
            0.0
        }
    }
}

/// Marker flags carried by a stored point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PointFlags {
    /// Reached through an estimated stretch (long signal loss)
    #[serde(default)]
    pub estimated: bool,
    /// Synthesized to fill a short signal gap
    #[serde(default)]
    pub interpolated: bool,
    /// First point recorded after a pause
    #[serde(default)]
    pub stop_marker: bool,
}

impl PointFlags {
    pub fn interpolated() -> Self {
        Self { interpolated: true, ..Self::default() }
    }
}

/// A cleaned, stored point of the trace. Never mutated after append.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp_ms: u64,
    pub speed_kmh: f64,
    pub altitude_m: f64,
    pub heading_deg: f64,
    pub segment_index: SegmentIndex,
    #[serde(default)]
    pub flags: PointFlags,
}

/// Point-level rejection reasons
///
/// Serialized as the snake_case codes used in persisted state and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InvalidCoordinates,
    StationaryNoise,
    Teleportation,
    SharpZigzag,
    MicroZigzag,
    BackwardMovement,
    ZigzagRapid,
    BearingUnstable,
    SpeedIncoherence,
    LowAccuracy,
}

impl RejectReason {
    pub const COUNT: usize = 10;

    pub const ALL: [RejectReason; Self::COUNT] = [
        RejectReason::InvalidCoordinates,
        RejectReason::StationaryNoise,
        RejectReason::Teleportation,
        RejectReason::SharpZigzag,
        RejectReason::MicroZigzag,
        RejectReason::BackwardMovement,
        RejectReason::ZigzagRapid,
        RejectReason::BearingUnstable,
        RejectReason::SpeedIncoherence,
        RejectReason::LowAccuracy,
    ];

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::InvalidCoordinates => "invalid_coordinates",
            RejectReason::StationaryNoise => "stationary_noise",
            RejectReason::Teleportation => "teleportation",
            RejectReason::SharpZigzag => "sharp_zigzag",
            RejectReason::MicroZigzag => "micro_zigzag",
            RejectReason::BackwardMovement => "backward_movement",
            RejectReason::ZigzagRapid => "zigzag_rapid",
            RejectReason::BearingUnstable => "bearing_unstable",
            RejectReason::SpeedIncoherence => "speed_incoherence",
            RejectReason::LowAccuracy => "low_accuracy",
        }
    }

    /// Position in [`RejectReason::ALL`], used for per-reason counters
    #[inline]
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Suspicious outcomes are deferred to the confirmation buffer instead of discarded
    #[inline]
    pub fn is_suspicious(&self) -> bool {
        matches!(
            self,
            RejectReason::SharpZigzag
                | RejectReason::MicroZigzag
                | RejectReason::BackwardMovement
                | RejectReason::ZigzagRapid
                | RejectReason::BearingUnstable
                | RejectReason::SpeedIncoherence
        )
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running the validator rules on one candidate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationOutcome {
    pub accepted: bool,
    pub reason: Option<RejectReason>,
    pub measured_distance_m: f64,
    pub measured_speed_kmh: f64,
    pub bearing_delta_deg: f64,
}

impl ValidationOutcome {
    pub fn accept(distance_m: f64, speed_kmh: f64, bearing_delta_deg: f64) -> Self {
        Self {
            accepted: true,
            reason: None,
            measured_distance_m: distance_m,
            measured_speed_kmh: speed_kmh,
            bearing_delta_deg,
        }
    }

    pub fn reject(
        reason: RejectReason,
        distance_m: f64,
        speed_kmh: f64,
        bearing_delta_deg: f64,
    ) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
            measured_distance_m: distance_m,
            measured_speed_kmh: speed_kmh,
            bearing_delta_deg,
        }
    }

    /// True when the candidate should wait in the confirmation buffer
    #[inline]
    pub fn is_suspicious(&self) -> bool {
        self.reason.is_some_and(|r| r.is_suspicious())
    }
}

/// Lifecycle status of the recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Stopped,
}

impl SessionStatus {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended. `None` while a session is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    #[default]
    None,
    Completed,
    Discarded,
    Error,
}

impl EndReason {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::None => "none",
            EndReason::Completed => "completed",
            EndReason::Discarded => "discarded",
            EndReason::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "none" => Some(EndReason::None),
            "completed" => Some(EndReason::Completed),
            "discarded" => Some(EndReason::Discarded),
            "error" => Some(EndReason::Error),
            _ => None,
        }
    }

    /// Terminal reasons suppress restore-on-relaunch
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EndReason::None)
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timer state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionState {
    pub status: SessionStatus,
    pub started_at_ms: Option<u64>,
    /// Running time accumulated up to the last pause
    pub accumulated_ms: u64,
    pub paused_at_ms: Option<u64>,
    /// When the current running interval began
    pub running_since_ms: Option<u64>,
}

impl SessionState {
    /// Running time including the live interval
    pub fn elapsed_ms(&self, now_ms: u64) -> u64 {
        let live = match (self.status, self.running_since_ms) {
            (SessionStatus::Running, Some(since)) => now_ms.saturating_sub(since),
            _ => 0,
        };
        self.accumulated_ms + live
    }
}

/// Running statistics exposed to the summary screen
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TripStats {
    pub total_distance_m: f64,
    pub max_speed_kmh: f64,
    pub elapsed_s: u64,
    /// Time covered by consecutive points of the same segment
    #[serde(default)]
    pub moving_s: u64,
    pub stop_count: u32,
    pub stop_time_s: u64,
    pub fixes_received: u64,
    pub points_stored: u64,
    pub points_rejected: u64,
    pub points_sampled_out: u64,
    pub points_interpolated: u64,
}
