//! # Synchro Backend - Main Application Entry Point
//!
//! HTTP + WebSocket server that turns uploaded MP3 files into a stream of
//! per-chunk audio features and periodic relational analysis, for browser
//! visualizers that render in sync with playback.
//!
//! ## Application Architecture:
//! - **config**: application configuration (defaults, config.toml, environment)
//! - **state**: shared application state and metrics
//! - **audio**: MP3 decoding, spectral feature extraction, chunk sequencing
//! - **analysis**: sliding-window relational analysis (transitions, trends, patterns, predictions)
//! - **streaming**: session registry, production tasks, delivery queues, wire protocol
//! - **websocket**: one actor per connected client
//! - **handlers**: upload, session and config endpoints
//! - **health**: health and metrics endpoints
//! - **middleware**: request metrics
//! - **error**: domain and HTTP error types
//!
//! ## Request Flow:
//! 1. `POST /api/v1/upload` decodes the file and registers a session
//! 2. `GET /ws/{session_id}` upgrades to a WebSocket and starts production
//! 3. The production task extracts features window by window and analyzes them
//! 4. The WebSocket actor delivers records and reports until the stream is done

mod analysis;    // Relational analysis engine
mod audio;       // Decoding and feature extraction
mod config;      // Configuration management (config.rs)
mod error;       // Error handling types (error.rs)
mod handlers;    // HTTP request handlers (handlers/ directory)
mod health;      // Health check endpoints (health.rs)
mod middleware;  // Custom middleware (middleware/ directory)
mod state;       // Application state management (state.rs)
mod streaming;   // Sessions, production and delivery
mod websocket;   // WebSocket actor (websocket.rs)

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use audio::SpectralFeatureExtractor;
use config::AppConfig;
use state::AppState;
use std::sync::Arc;
use std::time::Duration;
use streaming::{ManagerSettings, SessionManager};
use tracing::{debug, error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often expired sessions are swept, at most.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Creates the session registry** and the shared application state
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown**, tearing down every live session
#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    // load() validates before returning
    let config = AppConfig::load()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let extractor = Arc::new(SpectralFeatureExtractor::new(config.streaming.frequency_bands));
    let sessions = Arc::new(SessionManager::new(
        ManagerSettings::from_config(&config),
        extractor,
    ));
    let app_state = AppState::new(config.clone(), sessions);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let sweeper = spawn_session_sweeper(app_state.clone());

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            // Middleware runs in reverse registration order for responses
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .configure(handlers::configure_api),
            )
            .route("/ws/{session_id}", web::get().to(websocket::session_stream))
            .route("/health", web::get().to(health::health_check))
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    sweeper.abort();
    let terminated = app_state.sessions.terminate_all();
    info!(terminated, "Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: controls what gets logged (e.g. "debug", "synchro_backend=trace")
/// - If not set, defaults to "synchro_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "synchro_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Periodically tear down sessions older than `session_ttl_secs`.
///
/// The TTL is re-read on every tick so `PUT /config` changes take effect.
fn spawn_session_sweeper(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let initial_ttl = state.get_config().performance.session_ttl();
        let period = initial_ttl.clamp(Duration::from_secs(1), SWEEP_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let ttl = state.get_config().performance.session_ttl();
            let removed = state.sessions.cleanup_expired(ttl);
            if removed > 0 {
                info!(removed, ttl_secs = ttl.as_secs(), "Expired sessions removed");
            } else {
                debug!("No expired sessions");
            }
        }
    })
}

/// Wait for SIGINT (Ctrl+C) or, on Unix, SIGTERM.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = ctrl_c() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

/// Resolves on Ctrl+C. If the handler cannot be installed it never resolves,
/// so the server keeps running instead of shutting down.
async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received SIGINT"),
        Err(e) => {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
