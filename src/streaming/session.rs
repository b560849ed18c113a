//! # Streaming Sessions
//!
//! One `StreamSession` exists per accepted upload. It owns everything the
//! stream needs: the decoded samples, the uploaded file on disk, the feature
//! and report histories, both delivery queues and the published state.
//!
//! ## Session Lifecycle:
//! 1. **Ready**: upload decoded, nothing produced yet
//! 2. **Processing**: the production task is running
//! 3. **Completed**: every window was produced and both queues carry the end marker
//! 4. **Failed**: production stopped on an error; `error` says why
//!
//! Transitions only move forward. Teardown (`release`) is separate from the
//! status: it frees the session's resources exactly once, whichever of an
//! explicit terminate or a cancelled production task gets there first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tempfile::NamedTempFile;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::queue::StreamQueue;
use crate::analysis::{AnalysisReport, FullHistory, ReportHistory};
use crate::audio::{AudioFileInfo, FeatureRecord};

/// Current status of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Ready,
    Processing,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Ready => "ready",
            SessionStatus::Processing => "processing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    fn stage(&self) -> u8 {
        match self {
            SessionStatus::Ready => 0,
            SessionStatus::Processing => 1,
            SessionStatus::Completed | SessionStatus::Failed => 2,
        }
    }

    /// Ready → Processing → {Completed | Failed}; never backwards, never out of a terminal state.
    pub fn can_advance_to(&self, next: SessionStatus) -> bool {
        next.stage() > self.stage()
    }
}

/// Snapshot of a session's progress, sent to clients as `status` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub status: SessionStatus,
    pub progress: f64,
    pub total_chunks: usize,
    pub processed_chunks: usize,
    /// Seconds of decoded audio.
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionState {
    fn ready(total_chunks: usize, duration: f64) -> Self {
        Self {
            status: SessionStatus::Ready,
            progress: 0.0,
            total_chunks,
            processed_chunks: 0,
            duration,
            error: None,
        }
    }

    fn set_processed(&mut self, processed_chunks: usize) {
        self.processed_chunks = processed_chunks.min(self.total_chunks);
        self.progress = if self.total_chunks == 0 {
            0.0
        } else {
            self.processed_chunks as f64 / self.total_chunks as f64
        };
    }
}

/// Per-session production parameters, fixed when the session is created.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub chunk_duration_seconds: f64,
    pub chunk_queue_capacity: usize,
    pub analysis_queue_capacity: usize,
    pub analysis_window_size: usize,
    pub analysis_interval: usize,
    pub producer_yield: std::time::Duration,
}

pub struct StreamSession {
    id: String,
    file_info: AudioFileInfo,
    sample_rate: u32,
    settings: SessionSettings,
    created_at: DateTime<Utc>,

    samples: Mutex<Option<Arc<Vec<f32>>>>,
    source: Mutex<Option<NamedTempFile>>,

    state: watch::Sender<SessionState>,
    history: FullHistory,
    reports: ReportHistory,
    chunk_queue: StreamQueue<FeatureRecord>,
    analysis_queue: StreamQueue<AnalysisReport>,

    cancel: CancellationToken,
    production: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StreamSession {
    pub(crate) fn new(
        id: String,
        file_info: AudioFileInfo,
        samples: Vec<f32>,
        sample_rate: u32,
        total_chunks: usize,
        settings: SessionSettings,
        source: Option<NamedTempFile>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::ready(total_chunks, file_info.duration_seconds));
        Self {
            id,
            sample_rate,
            created_at: Utc::now(),
            samples: Mutex::new(Some(Arc::new(samples))),
            source: Mutex::new(source),
            state,
            history: FullHistory::new(),
            reports: ReportHistory::new(),
            chunk_queue: StreamQueue::new(settings.chunk_queue_capacity),
            analysis_queue: StreamQueue::new(settings.analysis_queue_capacity),
            cancel: CancellationToken::new(),
            production: Mutex::new(None),
            released: AtomicBool::new(false),
            file_info,
            settings,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn file_info(&self) -> &AudioFileInfo {
        &self.file_info
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now().signed_duration_since(self.created_at)
    }

    pub fn history(&self) -> &FullHistory {
        &self.history
    }

    pub fn reports(&self) -> &ReportHistory {
        &self.reports
    }

    pub fn chunk_queue(&self) -> &StreamQueue<FeatureRecord> {
        &self.chunk_queue
    }

    pub fn analysis_queue(&self) -> &StreamQueue<AnalysisReport> {
        &self.analysis_queue
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Immutable copy of the current state.
    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every published state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Decoded samples, or `None` once the session has been released.
    pub fn samples(&self) -> Option<Arc<Vec<f32>>> {
        lock(&self.samples).clone()
    }

    /// Path of the uploaded file while the session still holds it.
    pub fn source_path(&self) -> Option<PathBuf> {
        lock(&self.source).as_ref().map(|file| file.path().to_path_buf())
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Install the production task handle unless one already exists.
    ///
    /// The closure runs at most once per session, under the lock, so two
    /// concurrent starts cannot both spawn a task.
    pub(crate) fn start_production(&self, spawn: impl FnOnce() -> JoinHandle<()>) -> bool {
        let mut production = lock(&self.production);
        if production.is_some() || self.is_released() {
            return false;
        }
        self.advance(SessionStatus::Processing, |_| {});
        *production = Some(spawn());
        true
    }

    /// Apply a forward status transition plus any field updates in one publish.
    fn advance(&self, next: SessionStatus, update: impl FnOnce(&mut SessionState)) -> bool {
        self.state.send_if_modified(|state| {
            if !state.status.can_advance_to(next) {
                return false;
            }
            state.status = next;
            update(state);
            true
        })
    }

    /// Progress update from the production task while still processing.
    pub(crate) fn record_progress(&self, processed_chunks: usize) {
        self.state.send_if_modified(|state| {
            if state.status != SessionStatus::Processing {
                return false;
            }
            state.set_processed(processed_chunks);
            true
        });
    }

    /// Final transition; progress reaches 1.0 in the same publish.
    pub(crate) fn complete(&self, processed_chunks: usize) -> bool {
        self.advance(SessionStatus::Completed, |state| {
            state.set_processed(processed_chunks);
        })
    }

    pub(crate) fn fail(&self, message: String) -> bool {
        self.advance(SessionStatus::Failed, |state| {
            state.error = Some(message);
        })
    }

    /// Free every resource held by the session. Only the first call does anything.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.cancel.cancel();
        self.chunk_queue.close();
        self.analysis_queue.close();
        self.history.clear();
        self.reports.clear();
        lock(&self.samples).take();
        // Dropping the temp file handle deletes it from disk.
        lock(&self.source).take();
        // The task exits on its own once it sees the cancelled token.
        lock(&self.production).take();

        debug!(session_id = %self.id, "Session resources released");
        true
    }
}
