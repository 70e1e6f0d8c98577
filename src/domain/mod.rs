//! Domain models - core trip recording types
//!
//! This module contains the canonical data types used throughout the system:
//! - `RawFix` - a measurement from the location service
//! - `TrackPoint` - a cleaned, stored point of the trace
//! - `RejectReason` / `ValidationOutcome` - validator verdicts
//! - `TraceView` / `TripSummary` - read-only views for rendering and egress
//! - `geo` - distance, bearing and projection helpers

pub mod geo;
pub mod trace;
pub mod types;

// Re-export commonly used types at module level
pub use trace::{SegmentView, TraceView, TripSummary};
pub use types::{
    EndReason, PointFlags, RawFix, RejectReason, SegmentIndex, SessionStatus, TrackPoint,
    TripStats, ValidationOutcome,
};
