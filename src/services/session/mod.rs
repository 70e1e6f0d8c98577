//! Recording session state machine
//!
//! The Session owns the whole fix pipeline and drives it through
//! `idle -> running <-> paused -> stopped -> idle`:
//! - Lifecycle commands (start, pause/resume, stop, reset, restore)
//! - Fix ingestion (smoother, validator, confirmation buffer, sampler, segments)
//! - Throttled and forced persistence
//! - App lifecycle transitions (background flush, foreground queue drain)
//!
//! It runs as a single consumer task: fixes and commands are handled one at
//! a time, and `SessionHandle` talks to it over a command channel.

mod pipeline;

pub use pipeline::{IngestOutcome, IngestResult};

use crate::domain::trace::{to_datetime, SegmentView, TraceView, TripSummary};
use crate::domain::types::{EndReason, RawFix, SessionState, SessionStatus, TripStats};
use crate::infra::clock::Clock;
use crate::infra::config::{Config, GapConfig, SourceConfig};
use crate::infra::metrics::Metrics;
use crate::io::persistence::{PersistenceWarning, RestoreSource, TracePersistence, TraceSnapshot};
use crate::io::source::{call_with_timeout, LocationSource, SourceError};
use crate::io::store::KeyValueStore;
use crate::services::confirmation::ConfirmationBuffer;
use crate::services::sampler::SamplingController;
use crate::services::segments::SegmentManager;
use crate::services::simplifier::Simplifier;
use crate::services::smoother::CoordinateSmoother;
use crate::services::speed::{MaxSpeedTracker, SpeedEstimator};
use crate::services::validator::PointValidator;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("location source failed to start: {0}")]
    StartFailed(SourceError),
    #[error("cannot {action} while {status}")]
    InvalidTransition { action: &'static str, status: SessionStatus },
    #[error("session task has shut down")]
    Closed,
}

/// App visibility transitions reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Background,
    Foreground,
}

impl Lifecycle {
    fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Background => "background",
            Lifecycle::Foreground => "foreground",
        }
    }
}

/// Trip recording session
pub struct Session {
    pub(crate) device_id: String,
    pub(crate) gaps: GapConfig,
    pub(crate) source_config: SourceConfig,
    pub(crate) artifacts_dir: PathBuf,
    pub(crate) state: SessionState,
    pub(crate) end_reason: EndReason,
    pub(crate) trip_id: Uuid,
    pub(crate) smoother: CoordinateSmoother,
    pub(crate) speed: SpeedEstimator,
    pub(crate) max_speed: MaxSpeedTracker,
    pub(crate) validator: PointValidator,
    pub(crate) buffer: ConfirmationBuffer,
    pub(crate) sampler: SamplingController,
    pub(crate) segments: SegmentManager,
    pub(crate) simplifier: Simplifier,
    pub(crate) persistence: TracePersistence,
    pub(crate) source: Arc<dyn LocationSource>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) status_tx: watch::Sender<SessionStatus>,
    /// Timestamp of the last raw fix accepted into the pipeline
    pub(crate) last_fix_ts: Option<u64>,
    pub(crate) fixes_received: u64,
    pub(crate) points_rejected: u64,
    pub(crate) points_sampled_out: u64,
    pub(crate) points_interpolated: u64,
    pub(crate) stop_count: u32,
    pub(crate) stop_time_ms: u64,
    pub(crate) warnings: Vec<PersistenceWarning>,
}

impl Session {
    pub fn new(
        config: &Config,
        store: Arc<dyn KeyValueStore>,
        source: Arc<dyn LocationSource>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let validator = config.validator().clone();
        let buffer = ConfirmationBuffer::new(validator.buffer_capacity, validator.confirm_bearing_deg);
        let (status_tx, _) = watch::channel(SessionStatus::Idle);

        Self {
            device_id: config.device_id().to_string(),
            gaps: config.gaps().clone(),
            source_config: config.source().clone(),
            artifacts_dir: PathBuf::from(&config.persistence().artifacts_dir),
            state: SessionState::default(),
            end_reason: EndReason::None,
            trip_id: Uuid::now_v7(),
            smoother: CoordinateSmoother::new(config.smoother().clone()),
            speed: SpeedEstimator::new(config.speed()),
            max_speed: MaxSpeedTracker::new(config.speed()),
            validator: PointValidator::new(validator),
            buffer,
            sampler: SamplingController::new(config.sampling().clone()),
            segments: SegmentManager::new(),
            simplifier: Simplifier::new(config.simplifier().clone(), metrics.clone()),
            persistence: TracePersistence::new(store, config.persistence().clone(), metrics.clone()),
            source,
            clock,
            metrics,
            status_tx,
            last_fix_ts: None,
            fixes_received: 0,
            points_rejected: 0,
            points_sampled_out: 0,
            points_interpolated: 0,
            stop_count: 0,
            stop_time_ms: 0,
            warnings: Vec::new(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.state.status
    }

    /// Status feed for the watchdog
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    pub fn trip_id(&self) -> Uuid {
        self.trip_id
    }

    /// Persistence problems hit at state transitions
    pub fn warnings(&self) -> &[PersistenceWarning] {
        &self.warnings
    }

    pub fn segments(&self) -> &SegmentManager {
        &self.segments
    }

    fn is_active(&self) -> bool {
        matches!(self.state.status, SessionStatus::Running | SessionStatus::Paused)
    }

    fn set_status(&mut self, status: SessionStatus) {
        self.state.status = status;
        self.status_tx.send_replace(status);
    }

    /// Clear every per-trip component and counter
    fn reset_components(&mut self) {
        self.smoother.reset();
        self.speed.reset();
        self.max_speed.reset();
        self.buffer.clear();
        self.segments.reset();
        self.simplifier.reset();
        self.state = SessionState::default();
        self.end_reason = EndReason::None;
        self.last_fix_ts = None;
        self.fixes_received = 0;
        self.points_rejected = 0;
        self.points_sampled_out = 0;
        self.points_interpolated = 0;
        self.stop_count = 0;
        self.stop_time_ms = 0;
        self.warnings.clear();
    }

    pub(crate) fn trace_snapshot(&self, now_ms: u64) -> TraceSnapshot<'_> {
        TraceSnapshot {
            points: self.segments.points(),
            segment_starts: self.segments.segment_starts(),
            estimated: self.segments.estimated(),
            last_fix_ts: self.last_fix_ts,
            max_speed_kmh: self.max_speed.max_kmh(),
            stop_count: self.stop_count,
            stop_time_ms: self.stop_time_ms,
            started_at_ms: self.state.started_at_ms,
            accumulated_ms: self.state.elapsed_ms(now_ms),
            paused: self.state.status == SessionStatus::Paused,
        }
    }

    /// Forced write; failure is kept as a warning and the session carries on
    async fn flush(&mut self, transition: &'static str) {
        let now = self.clock.now_ms();
        let result = self.persistence.persist_forced(&self.trace_snapshot(now), transition).await;
        if let Err(warning) = result {
            warn!(transition = %transition, error = %warning, "persistence_warning");
            self.warnings.push(warning);
        }
    }

    /// Begin a new trip
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.is_active() {
            return Err(SessionError::InvalidTransition { action: "start", status: self.state.status });
        }

        self.persistence.clear_working();
        if let Err(e) = self.persistence.save_end_reason(EndReason::None) {
            warn!(error = %e, "end_reason_save_failed");
        }
        self.reset_components();
        self.trip_id = Uuid::now_v7();

        let now = self.clock.now_ms();
        self.state.started_at_ms = Some(now);
        self.state.running_since_ms = Some(now);
        self.set_status(SessionStatus::Running);

        if let Err(e) = call_with_timeout(self.source_config.call_timeout_ms, self.source.start()).await {
            error!(trip_id = %self.trip_id, error = %e, "session_start_failed");
            self.reset_components();
            self.set_status(SessionStatus::Idle);
            return Err(SessionError::StartFailed(e));
        }

        self.flush("start").await;
        info!(trip_id = %self.trip_id, started_at_ms = %now, "session_started");
        Ok(())
    }

    pub async fn pause(&mut self) -> Result<(), SessionError> {
        if self.state.status != SessionStatus::Running {
            return Err(SessionError::InvalidTransition { action: "pause", status: self.state.status });
        }

        let now = self.clock.now_ms();
        self.state.accumulated_ms = self.state.elapsed_ms(now);
        self.state.running_since_ms = None;
        self.state.paused_at_ms = Some(now);
        self.stop_count += 1;
        self.set_status(SessionStatus::Paused);

        self.flush("pause").await;
        info!(
            trip_id = %self.trip_id,
            points = %self.segments.len(),
            stop_count = %self.stop_count,
            "session_paused"
        );
        Ok(())
    }

    pub async fn resume(&mut self) -> Result<(), SessionError> {
        if self.state.status != SessionStatus::Paused {
            return Err(SessionError::InvalidTransition { action: "resume", status: self.state.status });
        }

        let now = self.clock.now_ms();
        if let Some(paused_at) = self.state.paused_at_ms.take() {
            self.stop_time_ms += now.saturating_sub(paused_at);
        }
        self.state.running_since_ms = Some(now);

        let segment = self.segments.open_segment();
        let dropped = self.buffer.clear();
        if dropped > 0 {
            self.metrics.record_buffer_dropped(dropped);
        }
        // No gap filling across a pause
        self.last_fix_ts = None;
        self.set_status(SessionStatus::Running);

        self.flush("resume").await;
        info!(trip_id = %self.trip_id, segment = %segment, "session_resumed");
        Ok(())
    }

    /// Pause when running, resume when paused. Returns the new status.
    pub async fn toggle_pause(&mut self) -> Result<SessionStatus, SessionError> {
        match self.state.status {
            SessionStatus::Running => self.pause().await?,
            SessionStatus::Paused => self.resume().await?,
            status => return Err(SessionError::InvalidTransition { action: "toggle pause", status }),
        }
        Ok(self.state.status)
    }

    /// Finish the trip and return its summary
    pub async fn stop(&mut self, reason: EndReason) -> Result<TripSummary, SessionError> {
        if !self.is_active() {
            return Err(SessionError::InvalidTransition { action: "stop", status: self.state.status });
        }

        let now = self.clock.now_ms();
        self.state.accumulated_ms = self.state.elapsed_ms(now);
        self.state.running_since_ms = None;
        if let Some(paused_at) = self.state.paused_at_ms.take() {
            self.stop_time_ms += now.saturating_sub(paused_at);
        }
        self.end_reason = reason;
        self.set_status(SessionStatus::Stopped);

        if !self.segments.is_empty() {
            let ranges = self.segments.segment_ranges();
            self.simplifier.run(self.segments.points(), &ranges);
        }
        self.flush("stop").await;

        let summary = self.summary(now);

        if let Err(e) = self.persistence.save_end_reason(reason) {
            warn!(error = %e, "end_reason_save_failed");
        }
        if let Err(e) = call_with_timeout(self.source_config.call_timeout_ms, self.source.stop()).await {
            warn!(error = %e, "source_stop_failed");
        }
        self.persistence.clear_working();

        info!(
            trip_id = %summary.trip_id,
            end_reason = %reason,
            points = %summary.point_count(),
            distance_m = format!("{:.1}", summary.stats.total_distance_m),
            max_speed_kmh = format!("{:.1}", summary.stats.max_speed_kmh),
            "session_stopped"
        );

        self.reset_components();
        self.set_status(SessionStatus::Idle);
        Ok(summary)
    }

    /// Discard the trip and delete its artifacts
    pub async fn reset(&mut self) -> Result<(), SessionError> {
        if self.is_active() {
            self.stop(EndReason::Discarded).await?;
        } else {
            self.persistence.clear_working();
            self.reset_components();
            self.set_status(SessionStatus::Idle);
        }

        if self.artifacts_dir.exists() {
            match std::fs::remove_dir_all(&self.artifacts_dir) {
                Ok(()) => debug!(dir = %self.artifacts_dir.display(), "artifacts_removed"),
                Err(e) => warn!(dir = %self.artifacts_dir.display(), error = %e, "artifacts_remove_failed"),
            }
        }
        info!("session_reset");
        Ok(())
    }

    /// Rebuild an interrupted session after relaunch.
    ///
    /// Returns where the trace came from, or `None` when there is nothing
    /// to resume (no session persisted, or it already ended).
    pub async fn restore(&mut self) -> Result<Option<RestoreSource>, SessionError> {
        if self.is_active() {
            return Err(SessionError::InvalidTransition { action: "restore", status: self.state.status });
        }

        let restored = self.persistence.restore();
        if restored.end_reason.is_terminal() {
            info!(end_reason = %restored.end_reason, "restore_skipped_finished");
            return Ok(None);
        }
        if restored.started_at_ms.is_none() && restored.points.is_empty() {
            debug!("restore_nothing_persisted");
            return Ok(None);
        }

        self.reset_components();
        let source = restored.source;
        let paused = restored.paused;
        self.segments.restore(restored.points, restored.segment_starts, restored.estimated);
        self.max_speed.set_max(restored.max_speed_kmh);
        self.last_fix_ts = restored.last_fix_ts;
        self.stop_count = restored.stop_count;
        self.stop_time_ms = restored.stop_time_ms;

        let now = self.clock.now_ms();
        self.state.started_at_ms = restored.started_at_ms.or(Some(now));
        self.state.accumulated_ms = restored.accumulated_ms;

        if paused {
            self.state.paused_at_ms = Some(now);
            self.set_status(SessionStatus::Paused);
        } else {
            self.state.running_since_ms = Some(now);
            self.set_status(SessionStatus::Running);
        }

        // The source keeps running through pauses, so it is needed either way
        if let Err(e) = call_with_timeout(self.source_config.call_timeout_ms, self.source.start()).await {
            error!(error = %e, "session_restore_start_failed");
            self.reset_components();
            self.set_status(SessionStatus::Idle);
            return Err(SessionError::StartFailed(e));
        }

        info!(
            trip_id = %self.trip_id,
            source = ?source,
            points = %self.segments.len(),
            segments = %self.segments.segment_starts().len(),
            status = %self.state.status,
            "session_restored"
        );
        Ok(Some(source))
    }

    /// Flush on any transition; on foreground also replay fixes the source
    /// queued while backgrounded. Returns the number of queued fixes drained.
    pub async fn on_lifecycle(&mut self, event: Lifecycle) -> usize {
        if self.is_active() {
            self.flush(event.as_str()).await;
        }
        if event == Lifecycle::Background {
            return 0;
        }

        let queued = self.persistence.load_source_queue();
        if queued.is_empty() {
            return 0;
        }

        let batch = self.source_config.drain_batch.max(1);
        for chunk in queued.chunks(batch) {
            for fix in chunk {
                self.ingest(*fix);
            }
            tokio::task::yield_now().await;
        }

        if let Err(e) = self.persistence.clear_source_queue() {
            warn!(error = %e, "source_queue_clear_failed");
        }
        info!(fixes = %queued.len(), "source_queue_drained");
        queued.len()
    }

    pub fn stats(&self) -> TripStats {
        let now = self.clock.now_ms();
        let live_stop_ms = match (self.state.status, self.state.paused_at_ms) {
            (SessionStatus::Paused, Some(paused_at)) => now.saturating_sub(paused_at),
            _ => 0,
        };
        TripStats {
            total_distance_m: self.segments.total_distance_m(),
            max_speed_kmh: self.max_speed.max_kmh(),
            elapsed_s: self.state.elapsed_ms(now) / 1000,
            moving_s: self.segments.moving_duration_ms() / 1000,
            stop_count: self.stop_count,
            stop_time_s: (self.stop_time_ms + live_stop_ms) / 1000,
            fixes_received: self.fixes_received,
            points_stored: self.segments.len() as u64,
            points_rejected: self.points_rejected,
            points_sampled_out: self.points_sampled_out,
            points_interpolated: self.points_interpolated,
        }
    }

    fn segment_views(&self) -> Vec<SegmentView> {
        self.segments
            .segment_ranges()
            .into_iter()
            .map(|(index, range)| SegmentView {
                index,
                start_offset: range.start,
                points: self.segments.points()[range].to_vec(),
            })
            .collect()
    }

    /// Live view for rendering. The polyline is the latest throttled run.
    pub fn trace_view(&self) -> TraceView {
        TraceView {
            segments: self.segment_views(),
            estimated: self.segments.estimated().to_vec(),
            polyline: self.simplifier.latest().map(|s| s.polyline.clone()).unwrap_or_default(),
            stats: self.stats(),
        }
    }

    fn summary(&self, now_ms: u64) -> TripSummary {
        let latest = self.simplifier.latest();
        TripSummary {
            trip_id: self.trip_id.to_string(),
            device_id: self.device_id.clone(),
            started_at: self.state.started_at_ms.and_then(to_datetime),
            ended_at: to_datetime(now_ms),
            end_reason: self.end_reason,
            stats: self.stats(),
            segments: self.segment_views(),
            estimated: self.segments.estimated().to_vec(),
            polyline: latest.map(|s| s.polyline.clone()).unwrap_or_default(),
            simplified_points: latest.map(|s| s.indices.len()).unwrap_or(0),
            warnings: self.warnings.iter().map(|w| w.to_string()).collect(),
        }
    }

    /// Consume fixes and commands until shutdown or until every handle is gone
    pub async fn run(
        mut self,
        mut fix_rx: mpsc::Receiver<RawFix>,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut fixes_open = true;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            // Fixes delivered before the command are handled first
                            while let Ok(fix) = fix_rx.try_recv() {
                                self.ingest(fix);
                            }
                            self.handle_command(cmd).await;
                        }
                        None => break, // All handles dropped
                    }
                }
                fix = fix_rx.recv(), if fixes_open => {
                    match fix {
                        Some(fix) => {
                            self.ingest(fix);
                        }
                        None => fixes_open = false,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Leave an interrupted trip restorable
        if self.is_active() {
            self.flush("shutdown").await;
        }
        info!(status = %self.state.status, "session_task_exited");
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        // Reply errors mean the caller went away; nothing to do
        match cmd {
            SessionCommand::Start(reply) => {
                let _ = reply.send(self.start().await);
            }
            SessionCommand::TogglePause(reply) => {
                let _ = reply.send(self.toggle_pause().await);
            }
            SessionCommand::Stop(reason, reply) => {
                let _ = reply.send(self.stop(reason).await);
            }
            SessionCommand::Reset(reply) => {
                let _ = reply.send(self.reset().await);
            }
            SessionCommand::Restore(reply) => {
                let _ = reply.send(self.restore().await);
            }
            SessionCommand::Lifecycle(event, reply) => {
                let _ = reply.send(self.on_lifecycle(event).await);
            }
            SessionCommand::View(reply) => {
                let _ = reply.send(self.trace_view());
            }
            SessionCommand::Status(reply) => {
                let _ = reply.send(self.state.status);
            }
        }
    }
}

/// Commands accepted by the session task
#[derive(Debug)]
pub enum SessionCommand {
    Start(oneshot::Sender<Result<(), SessionError>>),
    TogglePause(oneshot::Sender<Result<SessionStatus, SessionError>>),
    Stop(EndReason, oneshot::Sender<Result<TripSummary, SessionError>>),
    Reset(oneshot::Sender<Result<(), SessionError>>),
    Restore(oneshot::Sender<Result<Option<RestoreSource>, SessionError>>),
    Lifecycle(Lifecycle, oneshot::Sender<usize>),
    View(oneshot::Sender<TraceView>),
    Status(oneshot::Sender<SessionStatus>),
}

/// Cloneable control surface for a running session task
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn new(tx: mpsc::Sender<SessionCommand>) -> Self {
        Self { tx }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(make(reply_tx)).await.map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn start(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::Start).await?
    }

    pub async fn toggle_pause(&self) -> Result<SessionStatus, SessionError> {
        self.request(SessionCommand::TogglePause).await?
    }

    pub async fn stop(&self, reason: EndReason) -> Result<TripSummary, SessionError> {
        self.request(|reply| SessionCommand::Stop(reason, reply)).await?
    }

    pub async fn reset(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::Reset).await?
    }

    pub async fn restore(&self) -> Result<Option<RestoreSource>, SessionError> {
        self.request(SessionCommand::Restore).await?
    }

    pub async fn lifecycle(&self, event: Lifecycle) -> Result<usize, SessionError> {
        self.request(|reply| SessionCommand::Lifecycle(event, reply)).await
    }

    pub async fn view(&self) -> Result<TraceView, SessionError> {
        self.request(SessionCommand::View).await
    }

    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        self.request(SessionCommand::Status).await
    }
}

/// Command channel for a session task
pub fn command_channel(capacity: usize) -> (SessionHandle, mpsc::Receiver<SessionCommand>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (SessionHandle::new(tx), rx)
}
