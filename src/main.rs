//! Trip recorder - replays a recorded fix stream through a full session
//!
//! Runs the same pipeline a device would: location source, session task,
//! background watchdog and metrics reporter. When the replay ends the trip
//! is stopped and its summary appended to the egress file. Interrupting
//! with Ctrl+C leaves the trip persisted so the next run restores it.
//!
//! Module structure:
//! - `domain/` - Core types (RawFix, TrackPoint, TripSummary)
//! - `io/` - External interfaces (location source, store, persistence, egress)
//! - `services/` - Recording logic (Session, pipeline stages, Watchdog)
//! - `infra/` - Infrastructure (Config, Metrics, Clock)

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use trip_trace::domain::types::{EndReason, SessionStatus};
use trip_trace::infra::{Clock, Config, Metrics, SystemClock};
use trip_trace::io::{fix_channel, FileStore, KeyValueStore, LocationSource, ReplaySource, TripEgress};
use trip_trace::services::{command_channel, Lifecycle, Session, Watchdog, WatchdogAlert};

/// Trip recorder - GPS trace recording core
#[derive(Parser, Debug)]
#[command(name = "trip-recorder", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// JSONL file of raw fixes to replay
    #[arg(short, long, default_value = "data/fixes.jsonl")]
    input: String,

    /// Replay speed multiplier (0 = as fast as possible)
    #[arg(short, long, default_value_t = 0.0)]
    speedup: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for per-point decisions
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "trip-recorder starting");

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(&[]),
    };

    info!(
        config_file = %config.config_file(),
        device_id = %config.device_id(),
        store_dir = %config.persistence().store_dir,
        egress_file = %config.egress_file(),
        input = %args.input,
        speedup = %args.speedup,
        "config_loaded"
    );

    let metrics = Arc::new(Metrics::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn KeyValueStore> = Arc::new(
        FileStore::open(&config.persistence().store_dir)
            .with_context(|| format!("Failed to open store at {}", config.persistence().store_dir))?,
    );

    // Bounded fix channel; the sender stamps liveness for the watchdog
    let (fix_sender, fix_rx, liveness) =
        fix_channel(config.source().channel_capacity, clock.clone(), metrics.clone());
    let replay = Arc::new(
        ReplaySource::from_file(&args.input, fix_sender, args.speedup)
            .with_context(|| format!("Failed to load fixes from {}", args.input))?,
    );
    let source: Arc<dyn LocationSource> = replay.clone();

    let session = Session::new(&config, store, source.clone(), clock.clone(), metrics.clone());
    let status_rx = session.subscribe_status();

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (handle, cmd_rx) = command_channel(16);
    let session_shutdown = shutdown_rx.clone();
    let session_task = tokio::spawn(async move {
        session.run(fix_rx, cmd_rx, session_shutdown).await;
    });

    // Start background watchdog
    let (alert_tx, mut alert_rx) = mpsc::channel::<WatchdogAlert>(8);
    let watchdog = Watchdog::new(
        source,
        status_rx,
        liveness,
        clock,
        metrics.clone(),
        config.watchdog().clone(),
        alert_tx,
    );
    let watchdog_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        watchdog.run(watchdog_shutdown).await;
    });

    // Surface watchdog alerts
    tokio::spawn(async move {
        while let Some(alert) = alert_rx.recv().await {
            match alert {
                WatchdogAlert::RestartFailed { silent_ms, error } => {
                    error!(silent_ms = %silent_ms, error = %error, "location_updates_stopped");
                }
            }
        }
    });

    // Start metrics reporter (lock-free reads with full summary)
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Resume an interrupted trip, otherwise begin a new one
    match handle.restore().await? {
        Some(restored_from) => {
            info!(source = ?restored_from, "trip_resumed");
            if handle.status().await? == SessionStatus::Paused {
                handle.toggle_pause().await?;
            }
        }
        None => handle.start().await?,
    }
    handle.lifecycle(Lifecycle::Foreground).await?;
    info!(fixes = %replay.len(), "replay_running");

    let finished = tokio::select! {
        _ = replay.wait_finished() => true,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown_signal_received");
            false
        }
    };

    if finished {
        let summary = handle.stop(EndReason::Completed).await?;
        let egress = TripEgress::new(config.egress_file());
        if !egress.write_trip(&summary) {
            warn!(trip_id = %summary.trip_id, "trip_not_egressed");
        }
    } else {
        handle.lifecycle(Lifecycle::Background).await?;
        info!("trip_left_restorable");
    }

    let _ = shutdown_tx.send(true);
    session_task.await.context("Session task panicked")?;
    metrics.report().log();

    info!("trip-recorder shutdown complete");
    Ok(())
}
