//! # Session Manager
//!
//! Registry of live streaming sessions, keyed by session id.
//!
//! ## Thread Safety:
//! Uses RwLock to allow many readers (status lookups, WebSocket binds) or one
//! writer (create/terminate) at a time. Sessions themselves are handed out as
//! `Arc<StreamSession>`, so a handler can keep using one after it has been
//! removed from the registry; its resources are released on removal regardless.
//!
//! ## Resource Management:
//! - Enforces the maximum concurrent session limit
//! - Spawns exactly one production task per session
//! - Tears sessions down on request, on TTL expiry, and on server shutdown

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use uuid::Uuid;

use super::producer;
use super::session::{SessionSettings, SessionState, StreamSession};
use crate::audio::{window_count, window_samples, AudioFileInfo, FeatureExtractor};
use crate::config::AppConfig;
use crate::error::StreamError;

pub type SessionHandle = Arc<StreamSession>;

/// Limits and production parameters applied to newly created sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerSettings {
    pub max_concurrent_sessions: usize,
    pub session: SessionSettings,
}

impl ManagerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let streaming = &config.streaming;
        Self {
            max_concurrent_sessions: config.performance.max_concurrent_sessions,
            session: SessionSettings {
                chunk_duration_seconds: streaming.chunk_duration_seconds,
                chunk_queue_capacity: streaming.chunk_queue_capacity,
                analysis_queue_capacity: streaming.analysis_queue_capacity,
                analysis_window_size: streaming.analysis_window_size,
                analysis_interval: streaming.analysis_interval,
                producer_yield: streaming.producer_yield(),
            },
        }
    }
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    settings: RwLock<ManagerSettings>,
    extractor: Arc<dyn FeatureExtractor>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("active_sessions", &self.active_count())
            .field("settings", &self.settings())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    pub fn new(settings: ManagerSettings, extractor: Arc<dyn FeatureExtractor>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            settings: RwLock::new(settings),
            extractor,
        }
    }

    fn sessions(&self) -> RwLockReadGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn sessions_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> ManagerSettings {
        self.settings.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the settings used for sessions created from now on.
    pub fn update_settings(&self, settings: ManagerSettings) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    /// Register a new session in the Ready state.
    ///
    /// ## Validation:
    /// - chunk duration and sample rate must be positive
    /// - there must be at least one sample and at least one sample per window
    /// - the concurrent session limit must not be reached
    pub fn create(
        &self,
        file_info: AudioFileInfo,
        samples: Vec<f32>,
        sample_rate: u32,
        source: Option<NamedTempFile>,
    ) -> Result<SessionHandle, StreamError> {
        let settings = self.settings();
        let chunk_duration = settings.session.chunk_duration_seconds;

        if !(chunk_duration.is_finite() && chunk_duration > 0.0) {
            return Err(StreamError::InvalidInput(
                "chunk duration must be greater than 0".to_string(),
            ));
        }
        if sample_rate == 0 {
            return Err(StreamError::InvalidInput(
                "sample rate must be greater than 0".to_string(),
            ));
        }
        if samples.is_empty() {
            return Err(StreamError::InvalidInput("audio contains no samples".to_string()));
        }
        let window = window_samples(chunk_duration, sample_rate);
        if window == 0 {
            return Err(StreamError::InvalidInput(format!(
                "a {}s chunk at {} Hz holds no samples",
                chunk_duration, sample_rate
            )));
        }
        let total_chunks = window_count(samples.len(), window);

        let mut sessions = self.sessions_mut();
        if sessions.len() >= settings.max_concurrent_sessions {
            return Err(StreamError::CapacityExceeded(settings.max_concurrent_sessions));
        }

        let session_id = format!("session_{}", Uuid::new_v4().simple());
        let session = Arc::new(StreamSession::new(
            session_id.clone(),
            file_info,
            samples,
            sample_rate,
            total_chunks,
            settings.session,
            source,
        ));
        sessions.insert(session_id.clone(), session.clone());

        info!(
            session_id = %session_id,
            filename = %session.file_info().filename,
            total_chunks,
            "Session created"
        );
        Ok(session)
    }

    /// Make sure the session's production task is running. Safe to call repeatedly.
    pub fn start(&self, session_id: &str) -> Result<SessionHandle, StreamError> {
        let session = self
            .get(session_id)
            .ok_or_else(|| StreamError::SessionNotFound(session_id.to_string()))?;

        let extractor = self.extractor.clone();
        let task_session = session.clone();
        if session.start_production(move || producer::spawn(task_session, extractor)) {
            info!(session_id = %session_id, "Production started");
        }
        Ok(session)
    }

    pub fn status(&self, session_id: &str) -> Result<SessionState, StreamError> {
        self.get(session_id)
            .map(|session| session.snapshot())
            .ok_or_else(|| StreamError::SessionNotFound(session_id.to_string()))
    }

    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions().get(session_id).cloned()
    }

    /// Remove the session and release its resources. Unknown ids are a no-op.
    pub fn terminate(&self, session_id: &str) -> bool {
        let removed = self.sessions_mut().remove(session_id);
        match removed {
            Some(session) => {
                session.release();
                info!(session_id = %session_id, "Session terminated");
                true
            }
            None => {
                debug!(session_id = %session_id, "Terminate for unknown session ignored");
                false
            }
        }
    }

    /// Terminate sessions older than `max_age`; returns how many were removed.
    pub fn cleanup_expired(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let expired: Vec<String> = self
            .sessions()
            .values()
            .filter(|session| session.age() > max_age)
            .map(|session| session.id().to_string())
            .collect();

        expired.iter().filter(|id| self.terminate(id)).count()
    }

    /// Tear every session down; used on server shutdown.
    pub fn terminate_all(&self) -> usize {
        let drained: Vec<SessionHandle> = self.sessions_mut().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.release();
        }
        drained.len()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions().keys().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.sessions().len()
    }

    /// Id and status snapshot of every live session.
    pub fn summaries(&self) -> Vec<(String, SessionState)> {
        let mut summaries: Vec<(String, SessionState)> = self
            .sessions()
            .iter()
            .map(|(id, session)| (id.clone(), session.snapshot()))
            .collect();
        summaries.sort_by(|a, b| a.0.cmp(&b.0));
        summaries
    }
}
