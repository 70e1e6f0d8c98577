//! Replay of recorded fixes from a JSONL file
//!
//! Each line is one `RawFix`. Exports that carry an RFC 3339 `time`
//! instead of `timestamp_ms` are accepted too. Fixes are fed through a [`FixSender`],
//! optionally paced by their timestamps, so a replay exercises the same
//! path as a live location service.

use crate::domain::types::RawFix;
use crate::io::source::{FixSender, LocationSource, SourceError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Parse JSONL fixes, skipping blank and malformed lines
pub fn parse_fixes(content: &str) -> Vec<RawFix> {
    let mut fixes = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_line(line) {
            Ok(fix) => fixes.push(fix),
            Err(e) => warn!(line = %(line_no + 1), error = %e, "replay_line_skipped"),
        }
    }
    fixes
}

fn parse_line(line: &str) -> Result<RawFix, String> {
    let mut value: serde_json::Value = serde_json::from_str(line).map_err(|e| e.to_string())?;
    if let Some(obj) = value.as_object_mut() {
        if !obj.contains_key("timestamp_ms") {
            let iso = obj.get("time").and_then(|t| t.as_str()).ok_or("missing timestamp_ms or time")?;
            let ms = parse_iso_time(iso).ok_or_else(|| format!("bad time {}", iso))?;
            obj.insert("timestamp_ms".to_string(), ms.into());
        }
    }
    serde_json::from_value(value).map_err(|e| e.to_string())
}

/// Parse an RFC 3339 timestamp to epoch milliseconds
fn parse_iso_time(time_str: &str) -> Option<u64> {
    OffsetDateTime::parse(time_str, &Rfc3339)
        .ok()
        .and_then(|dt| u64::try_from(dt.unix_timestamp_nanos() / 1_000_000).ok())
}

pub struct ReplaySource {
    fixes: Arc<Vec<RawFix>>,
    sender: FixSender,
    /// Next fix to send; survives restarts
    cursor: Arc<AtomicUsize>,
    /// Replay speed multiplier; 0 sends without pacing
    speedup: f64,
    task: Mutex<Option<JoinHandle<()>>>,
    finished_tx: Arc<watch::Sender<bool>>,
}

impl ReplaySource {
    pub fn new(fixes: Vec<RawFix>, sender: FixSender, speedup: f64) -> Self {
        let (finished_tx, _) = watch::channel(false);
        Self {
            fixes: Arc::new(fixes),
            sender,
            cursor: Arc::new(AtomicUsize::new(0)),
            speedup,
            task: Mutex::new(None),
            finished_tx: Arc::new(finished_tx),
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P, sender: FixSender, speedup: f64) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| SourceError::Unavailable(format!("{}: {}", path.display(), e)))?;
        let fixes = parse_fixes(&content);
        info!(file = %path.display(), fixes = %fixes.len(), "replay_loaded");
        Ok(Self::new(fixes, sender, speedup))
    }

    pub fn len(&self) -> usize {
        self.fixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }

    pub fn position(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    /// Resolves once every fix has been sent
    pub async fn wait_finished(&self) {
        let mut rx = self.finished_tx.subscribe();
        // Sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|done| *done).await;
    }

    fn spawn(&self) -> JoinHandle<()> {
        let fixes = self.fixes.clone();
        let sender = self.sender.clone();
        let cursor = self.cursor.clone();
        let finished_tx = self.finished_tx.clone();
        let speedup = self.speedup;

        tokio::spawn(async move {
            let mut previous_ts: Option<u64> = None;
            loop {
                let index = cursor.load(Ordering::Relaxed);
                let Some(fix) = fixes.get(index).copied() else {
                    break;
                };

                if speedup > 0.0 {
                    if let Some(prev) = previous_ts {
                        let gap_ms = fix.timestamp_ms.saturating_sub(prev) as f64 / speedup;
                        tokio::time::sleep(Duration::from_millis(gap_ms as u64)).await;
                    }
                }
                previous_ts = Some(fix.timestamp_ms);

                if !sender.send_wait(fix).await {
                    warn!(index = %index, "replay_channel_closed");
                    return;
                }
                cursor.store(index + 1, Ordering::Relaxed);
            }

            info!(fixes = %fixes.len(), "replay_finished");
            finished_tx.send_replace(true);
        })
    }
}

#[async_trait]
impl LocationSource for ReplaySource {
    async fn start(&self) -> Result<(), SourceError> {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        *task = Some(self.spawn());
        info!(from = %self.position(), "replay_started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), SourceError> {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!(at = %self.position(), "replay_stopped");
        }
        Ok(())
    }

    async fn restart(&self) -> Result<(), SourceError> {
        self.stop().await?;
        self.start().await
    }
}
