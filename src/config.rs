//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **#[serde(default)]**: Missing fields fall back to the `Default` impl, so a config file
//!   only needs to list the values it changes
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER__PORT, APP_STREAMING__CHUNK_DURATION_SECONDS, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impls)

use anyhow::Result;              // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::env;                    // For reading environment variables
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, streaming, performance)
/// keeps the chunk cadence and analysis tuning apart from resource limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub streaming: StreamingConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,  // u16 = unsigned 16-bit integer (0-65535), perfect for port numbers
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
            port: 8000,
        }
    }
}

/// Chunk production and delivery settings.
///
/// ## Fields:
/// - `chunk_duration_seconds`: length of one feature window (0.2s gives 5 records per second)
/// - `frequency_bands`: number of log-spaced bands in each record
/// - `chunk_queue_capacity` / `analysis_queue_capacity`: bounded queue sizes; the
///   producer waits when a queue is full
/// - `analysis_window_size`: how many recent records the relational analyzer looks at
/// - `analysis_interval`: run the analyzer after every N records
/// - `producer_yield_ms`: pause between records so other sessions get scheduled
/// - `client_poll_timeout_ms`: how long a connection must be idle before the server
///   starts pushing queued items on its own
/// - `pull_timeout_ms`: how long an explicit `get_chunk`/`get_analysis` waits for an item
/// - `drain_batch_size`: maximum items pushed per idle tick
/// - `status_interval_chunks`: push a status message every N processed records
/// - `teardown_on_disconnect`: release the session when its WebSocket closes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub chunk_duration_seconds: f64,
    pub frequency_bands: usize,
    pub chunk_queue_capacity: usize,
    pub analysis_queue_capacity: usize,
    pub analysis_window_size: usize,
    pub analysis_interval: usize,
    pub producer_yield_ms: u64,
    pub client_poll_timeout_ms: u64,
    pub pull_timeout_ms: u64,
    pub drain_batch_size: usize,
    pub status_interval_chunks: usize,
    pub teardown_on_disconnect: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_duration_seconds: 0.2,
            frequency_bands: 20,
            chunk_queue_capacity: 50,
            analysis_queue_capacity: 10,
            analysis_window_size: 25,
            analysis_interval: 5,
            producer_yield_ms: 10,
            client_poll_timeout_ms: 100,
            pull_timeout_ms: 500,
            drain_batch_size: 20,
            status_interval_chunks: 10,
            teardown_on_disconnect: true,
        }
    }
}

impl StreamingConfig {
    pub fn producer_yield(&self) -> Duration {
        Duration::from_millis(self.producer_yield_ms)
    }

    pub fn client_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.client_poll_timeout_ms)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }
}

/// Resource limits.
///
/// ## Fields:
/// - `max_concurrent_sessions`: uploads beyond this are rejected with 503
/// - `max_upload_bytes`: largest accepted MP3 upload
/// - `session_ttl_secs`: sessions older than this are swept even without a disconnect
/// - `heartbeat_interval_secs` / `client_timeout_secs`: WebSocket liveness checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,  // usize = platform-specific unsigned integer (usually 64-bit)
    pub max_upload_bytes: usize,
    pub session_ttl_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 10,          // Reasonable for most development machines
            max_upload_bytes: 50 * 1024 * 1024,   // 50 MiB
            session_ttl_secs: 3600,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 60,
        }
    }
}

impl PerformanceConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

/// Implementation block for AppConfig - adds methods to the struct.
impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// Sections and fields are separated by a double underscore, because field
    /// names themselves contain single underscores.
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_STREAMING__CHUNK_QUEUE_CAPACITY=100`: Override chunk queue size
    /// - `APP_PERFORMANCE__MAX_CONCURRENT_SESSIONS=4`: Override the session limit
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults - converts our Default impl to config format
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists) - required(false) means "don't error if missing"
            .add_source(config::File::with_name("config").required(false))
            // 3. Load from environment variables with APP_ prefix
            // Example: APP_STREAMING__PULL_TIMEOUT_MS becomes streaming.pull_timeout_ms
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        // Handle special environment variables used by deployment platforms
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        // Build the final configuration and convert it back to our AppConfig struct
        let config: AppConfig = settings.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Chunk duration is a positive, finite number of seconds
    /// - Every count, capacity and interval that divides or bounds work is at least 1
    /// - The upload limit leaves room for at least one byte
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let streaming = &self.streaming;
        if !(streaming.chunk_duration_seconds.is_finite() && streaming.chunk_duration_seconds > 0.0) {
            return Err(anyhow::anyhow!("Chunk duration must be a positive number of seconds"));
        }

        let positive_counts = [
            ("frequency_bands", streaming.frequency_bands),
            ("chunk_queue_capacity", streaming.chunk_queue_capacity),
            ("analysis_queue_capacity", streaming.analysis_queue_capacity),
            ("analysis_window_size", streaming.analysis_window_size),
            ("analysis_interval", streaming.analysis_interval),
            ("drain_batch_size", streaming.drain_batch_size),
            ("status_interval_chunks", streaming.status_interval_chunks),
            ("max_concurrent_sessions", self.performance.max_concurrent_sessions),
            ("max_upload_bytes", self.performance.max_upload_bytes),
        ];
        if let Some((name, _)) = positive_counts.iter().find(|(_, value)| *value == 0) {
            return Err(anyhow::anyhow!("{} must be greater than 0", name));
        }

        if streaming.client_poll_timeout_ms == 0 {
            return Err(anyhow::anyhow!("client_poll_timeout_ms must be greater than 0"));
        }

        if self.performance.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("heartbeat_interval_secs must be greater than 0"));
        }

        if self.performance.client_timeout_secs <= self.performance.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "client_timeout_secs must be longer than heartbeat_interval_secs"
            ));
        }

        Ok(())  // All validation passed
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## What this does:
    /// 1. Turn the current configuration into a JSON value
    /// 2. Merge the provided fields over it, section by section
    /// 3. Deserialize the result back and validate it
    /// 4. Only replace `self` when everything succeeded
    ///
    /// ## Partial updates:
    /// You can send just `{"streaming": {"pull_timeout_ms": 250}}` to change one field.
    /// Streaming changes apply to sessions created after the update.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;
        if !partial_config.is_object() {
            return Err(anyhow::anyhow!("Configuration update must be a JSON object"));
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, partial_config);

        let updated: AppConfig = serde_json::from_value(merged)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

/// Recursively overlays `patch` onto `base`; objects merge, everything else replaces.
fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
