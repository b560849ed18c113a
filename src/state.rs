//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **config**: the runtime configuration, replaceable through `PUT /config`
//! - **metrics**: request counters and per-endpoint timings for `/metrics`
//! - **sessions**: the streaming session registry
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: every worker thread's copy of `AppState` points at the same data
//! - **RwLock**: many concurrent readers, or one writer
//! - Cloning `AppState` only bumps reference counts, so actix can hand a copy
//!   to each worker cheaply
//!
//! ### Lock poisoning
//! A panic while a lock is held "poisons" it. The data behind these locks is
//! plain counters and config values that stay consistent even then, so the
//! accessors recover the guard with `PoisonError::into_inner` instead of
//! propagating the panic to every later request.

use crate::config::AppConfig;
use crate::streaming::{ManagerSettings, SessionManager};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request metrics, updated by the metrics middleware on every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    /// Registry of streaming sessions created by uploads
    pub sessions: Arc<SessionManager>,
}

/// Counters collected across all HTTP requests and WebSocket connections.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of error responses since server start
    pub error_count: u64,

    /// WebSocket connections currently streaming a session
    pub active_connections: u32,

    /// Sessions created since server start
    pub sessions_created: u64,

    /// Per-endpoint statistics, keyed like "GET /api/v1/sessions/{id}/status"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    /// Number of requests to this specific endpoint
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    /// Number of errors that occurred for this endpoint
    pub error_count: u64,
}

impl AppState {
    /// Create the state from a validated configuration and a session registry.
    pub fn new(config: AppConfig, sessions: Arc<SessionManager>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            sessions,
        }
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked
    /// while the caller works with the values.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// Session limits and streaming parameters are pushed into the session
    /// registry as well; they apply to sessions created after this call.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;

        self.sessions
            .update_settings(ManagerSettings::from_config(&new_config));
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    /// Increment the total error counter (4xx and 5xx responses).
    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    /// Record timing and outcome for one request to `endpoint`.
    ///
    /// The first time an endpoint is seen a zeroed `EndpointMetric` is created
    /// through `entry().or_default()`.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn record_session_created(&self) {
        self.metrics_mut().sessions_created += 1;
    }

    /// A WebSocket connection bound to a session.
    pub fn connection_opened(&self) {
        self.metrics_mut().active_connections += 1;
    }

    /// A WebSocket connection went away. Never drops below zero.
    pub fn connection_closed(&self) {
        let mut metrics = self.metrics_mut();
        metrics.active_connections = metrics.active_connections.saturating_sub(1);
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// Cloning means the lock isn't held while the response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics().clone()
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time in milliseconds, 0 before the first request.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
