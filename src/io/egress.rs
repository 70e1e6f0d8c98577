//! Trip egress
//!
//! Each finished trip becomes one JSON object on its own line, appended to
//! the configured file. A failed write is logged and reported to the caller;
//! the trip itself is already gone from working storage by then.

use crate::domain::trace::TripSummary;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

pub struct TripEgress {
    path: PathBuf,
}

impl TripEgress {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        info!(file = %path.display(), "trip_egress_ready");
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `trip` as a JSON line. False when the file could not be written.
    pub fn write_trip(&self, trip: &TripSummary) -> bool {
        let line = trip.to_json();
        if let Err(e) = self.append(&line) {
            error!(trip_id = %trip.trip_id, file = %self.path.display(), error = %e, "trip_egress_failed");
            return false;
        }

        info!(
            trip_id = %trip.trip_id,
            end_reason = %trip.end_reason,
            points = %trip.point_count(),
            distance_m = %format!("{:.1}", trip.stats.total_distance_m),
            "trip_egressed"
        );
        true
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir)?,
            _ => {}
        }

        let mut out = OpenOptions::new().create(true).append(true).open(&self.path)?;
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        debug!(bytes = %line.len(), "trip_line_appended");
        Ok(())
    }
}
