//! Trace Inspect - offline view of a persisted trip
//!
//! Reads the key-value store a recorder left behind (for example after a
//! crash) and prints what a relaunch would restore, as JSON.
//!
//! Usage:
//!   trace-inspect --config config/dev.toml
//!   trace-inspect --store-dir data/store --points

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

use trip_trace::domain::trace::SegmentView;
use trip_trace::infra::{Config, Metrics};
use trip_trace::io::persistence::TracePersistence;
use trip_trace::io::FileStore;
use trip_trace::services::segments::SegmentManager;
use trip_trace::services::simplifier::Simplifier;

/// Trace Inspect - print persisted trip state
#[derive(Parser, Debug)]
#[command(name = "trace-inspect", version, about, long_about = None)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Store directory, overriding `persistence.store_dir` from config
    #[arg(short, long)]
    store_dir: Option<String>,

    /// Include every point grouped by segment
    #[arg(short, long)]
    points: bool,
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays valid JSON
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(&[]),
    };
    let store_dir = args.store_dir.unwrap_or_else(|| config.persistence().store_dir.clone());

    let store = FileStore::open(&store_dir).with_context(|| format!("Failed to open store at {}", store_dir))?;
    let metrics = Arc::new(Metrics::new());
    let persistence = TracePersistence::new(Arc::new(store), config.persistence().clone(), metrics.clone());

    let restored = persistence.restore();
    info!(source = ?restored.source, points = %restored.points.len(), "trace_loaded");

    let mut segments = SegmentManager::new();
    segments.restore(restored.points, restored.segment_starts, restored.estimated);

    let ranges = segments.segment_ranges();
    let mut simplifier = Simplifier::new(config.simplifier().clone(), metrics);
    let simplified = simplifier.run(segments.points(), &ranges).clone();

    let mut output = serde_json::json!({
        "source": restored.source,
        "end_reason": restored.end_reason,
        "paused": restored.paused,
        "started_at_ms": restored.started_at_ms,
        "accumulated_ms": restored.accumulated_ms,
        "last_fix_ts": restored.last_fix_ts,
        "points": segments.len(),
        "segments": ranges.len(),
        "segment_starts": segments.segment_starts(),
        "estimated": segments.estimated(),
        "distance_m": segments.total_distance_m(),
        "moving_s": segments.moving_duration_ms() / 1000,
        "max_speed_kmh": restored.max_speed_kmh,
        "stop_count": restored.stop_count,
        "stop_time_s": restored.stop_time_ms / 1000,
        "simplified_points": simplified.indices.len(),
        "tolerance_m": simplified.tolerance_m,
        "compression": simplified.compression,
        "polyline": simplified.polyline,
    });

    if args.points {
        let views: Vec<SegmentView> = ranges
            .iter()
            .map(|(index, range)| SegmentView {
                index: *index,
                start_offset: range.start,
                points: segments.points()[range.clone()].to_vec(),
            })
            .collect();
        output["segment_points"] = serde_json::to_value(views).context("Failed to serialize segments")?;
    }

    let rendered = serde_json::to_string_pretty(&output).context("Failed to render output")?;
    println!("{}", rendered);
    Ok(())
}
