pub mod config;
pub mod sessions;

pub use config::*;
pub use sessions::*;

use actix_web::web;

/// Routes mounted under `/api/v1`.
pub fn configure_api(cfg: &mut web::ServiceConfig) {
    cfg.route("/upload", web::post().to(upload_audio))
        .route("/sessions", web::get().to(list_sessions))
        .route("/sessions/{session_id}", web::delete().to(delete_session))
        .route("/sessions/{session_id}/status", web::get().to(session_status))
        .route("/sessions/{session_id}/chunks", web::get().to(session_chunks))
        .route("/audio/{session_id}", web::get().to(download_audio))
        .route("/config", web::get().to(get_config))
        .route("/config", web::put().to(update_config));
}
