//! End-to-end tests for a recording session over real stores and sources

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use trip_trace::domain::geo::offset_m;
use trip_trace::domain::types::{EndReason, RawFix, SegmentIndex, SessionStatus};
use trip_trace::domain::TripSummary;
use trip_trace::infra::config::WatchdogConfig;
use trip_trace::infra::{Clock, Config, ManualClock, Metrics};
use trip_trace::io::persistence::keys;
use trip_trace::io::{
    fix_channel, polyline, FileStore, KeyValueStore, LocationSource, ReplaySource, RestoreSource,
    SourceError, TripEgress,
};
use trip_trace::services::{command_channel, IngestOutcome, Lifecycle, Session, Watchdog, WatchdogAction};

const T0: u64 = 1_700_000_000_000;

#[derive(Default)]
struct CountingSource {
    restarts: AtomicU32,
}

#[async_trait]
impl LocationSource for CountingSource {
    async fn start(&self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn restart(&self) -> Result<(), SourceError> {
        self.restarts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn fix(north_m: f64, ts_ms: u64) -> RawFix {
    let (lat, lon) = offset_m(48.0, 2.0, north_m, 0.0);
    RawFix::new(lat, lon, ts_ms).with_speed_mps(10.0)
}

fn file_session(dir: &TempDir, clock: Arc<ManualClock>) -> Session {
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(dir.path()).unwrap());
    Session::new(
        &Config::default(),
        store,
        Arc::new(CountingSource::default()),
        clock,
        Arc::new(Metrics::new()),
    )
}

#[tokio::test]
async fn test_restore_after_crash_from_file_store() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));

    let mut first = file_session(&dir, clock.clone());
    first.start().await.unwrap();
    for i in 0..12u64 {
        first.ingest(fix(i as f64 * 10.0, 1000 + i * 1000));
    }
    assert_eq!(first.segments().len(), 12);
    // Backgrounding forces a write past the throttle
    first.on_lifecycle(Lifecycle::Background).await;
    drop(first);

    clock.advance(30_000);
    let mut second = file_session(&dir, clock.clone());
    let source = second.restore().await.unwrap();

    assert_eq!(source, Some(RestoreSource::Primary));
    assert_eq!(second.status(), SessionStatus::Running);
    assert_eq!(second.segments().len(), 12);

    let next = second.ingest(fix(120.0, 13_000));
    assert_eq!(next.outcome, IngestOutcome::Stored { index: 12 });
    assert_eq!(second.segments().points()[12].segment_index, SegmentIndex(0));
}

#[tokio::test]
async fn test_restore_falls_back_to_backup_copy() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));

    let mut first = file_session(&dir, clock.clone());
    first.start().await.unwrap();
    for i in 0..4u64 {
        first.ingest(fix(i as f64 * 10.0, 1000 + i * 1000));
    }
    first.pause().await.unwrap();
    drop(first);

    let store = FileStore::open(dir.path()).unwrap();
    store.set(keys::TRACE_PRIMARY, "{ truncated").unwrap();

    let mut second = file_session(&dir, clock);
    assert_eq!(second.restore().await.unwrap(), Some(RestoreSource::Backup));
    assert_eq!(second.status(), SessionStatus::Paused);
    assert_eq!(second.segments().len(), 4);
}

#[tokio::test]
async fn test_silent_source_restarted_once() {
    let clock = Arc::new(ManualClock::new(T0));
    let metrics = Arc::new(Metrics::new());
    let source = Arc::new(CountingSource::default());
    let (sender, _fix_rx, liveness) = fix_channel(16, clock.clone(), metrics.clone());

    let dir = TempDir::new().unwrap();
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(dir.path()).unwrap());
    let mut session = Session::new(&Config::default(), store, source.clone(), clock.clone(), metrics.clone());

    let (alert_tx, _alert_rx) = mpsc::channel(4);
    let mut watchdog = Watchdog::new(
        source.clone(),
        session.subscribe_status(),
        liveness,
        clock.clone(),
        metrics.clone(),
        WatchdogConfig::default(),
        alert_tx,
    );

    session.start().await.unwrap();
    assert!(sender.send(fix(0.0, 1000)));

    // Ten-second checks, then the source stays silent for 65 s
    for _ in 0..6 {
        clock.advance(10_000);
        assert_eq!(watchdog.check(clock.now_ms()).await, WatchdogAction::Healthy);
    }
    clock.advance(5_000);
    assert_eq!(watchdog.check(clock.now_ms()).await, WatchdogAction::Restarted);
    clock.advance(10_000);
    assert_eq!(watchdog.check(clock.now_ms()).await, WatchdogAction::AlreadyRestarted);

    assert_eq!(source.restarts.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.watchdog_restarts(), 1);

    // A paused session is not watched
    session.pause().await.unwrap();
    clock.advance(120_000);
    assert_eq!(watchdog.check(clock.now_ms()).await, WatchdogAction::NotRunning);
    assert_eq!(source.restarts.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_replay_through_session_task_to_egress() {
    let dir = TempDir::new().unwrap();
    let fixes_path = dir.path().join("fixes.jsonl");
    let lines: Vec<String> = (0..30u64)
        .map(|i| serde_json::to_string(&fix(i as f64 * 10.0, 1000 + i * 1000)).unwrap())
        .collect();
    std::fs::write(&fixes_path, lines.join("\n")).unwrap();

    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(T0));
    let metrics = Arc::new(Metrics::new());
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(dir.path().join("store")).unwrap());

    let (sender, fix_rx, _liveness) = fix_channel(64, clock.clone(), metrics.clone());
    let replay = Arc::new(ReplaySource::from_file(&fixes_path, sender, 0.0).unwrap());
    assert_eq!(replay.len(), 30);

    let session = Session::new(&Config::default(), store.clone(), replay.clone(), clock, metrics.clone());
    let (handle, cmd_rx) = command_channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(session.run(fix_rx, cmd_rx, shutdown_rx));

    handle.start().await.unwrap();
    replay.wait_finished().await;
    let summary: TripSummary = handle.stop(EndReason::Completed).await.unwrap();

    assert_eq!(summary.point_count(), 30);
    assert_eq!(summary.stats.fixes_received, 30);
    assert_eq!(summary.end_reason, EndReason::Completed);
    let decoded = polyline::decode(&summary.polyline).unwrap();
    assert_eq!(decoded.len(), summary.simplified_points);
    assert!(decoded.len() >= 2 && decoded.len() < 30);

    let egress_path = dir.path().join("out").join("trips.jsonl");
    let egress = TripEgress::new(egress_path.to_str().unwrap());
    assert!(egress.write_trip(&summary));
    let written = std::fs::read_to_string(&egress_path).unwrap();
    let parsed: TripSummary = serde_json::from_str(written.trim()).unwrap();
    assert_eq!(parsed.trip_id, summary.trip_id);

    // Working keys are gone, only the end reason survives
    assert_eq!(store.get(keys::TRACE_PRIMARY).unwrap(), None);
    assert_eq!(store.get(keys::SESSION_END_REASON).unwrap().as_deref(), Some("completed"));

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
    assert_eq!(metrics.fixes_received(), 30);
}
