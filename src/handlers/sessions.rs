//! Upload and session management endpoints.

use crate::audio::{decode_mp3, has_mp3_extension};
use crate::error::{AppError, AppResult, StreamError};
use crate::state::AppState;
use crate::streaming::SessionHandle;
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;
use serde_json::json;
use std::io::Write;
use tracing::info;

const UPLOAD_FIELD: &str = "file";

/// Accept an MP3 upload and create a streaming session for it.
///
/// ## Endpoint: `POST /api/v1/upload`
///
/// ## Request:
/// Multipart form data with the file in a field named "file"
///
/// ## Response:
/// ```json
/// {
///   "session_id": "session_4f7c...",
///   "file_info": {
///     "filename": "track.mp3",
///     "duration_seconds": 183.4,
///     "sample_rate": 44100,
///     "channels": 2
///   },
///   "total_chunks": 917
/// }
/// ```
pub async fn upload_audio(
    state: web::Data<AppState>,
    mut payload: Multipart,
) -> AppResult<HttpResponse> {
    let max_upload_bytes = state.get_config().performance.max_upload_bytes;
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(item) = payload.next().await {
        let mut field: Field =
            item.map_err(|e| AppError::BadRequest(format!("Multipart error: {}", e)))?;

        let content_disposition = field
            .content_disposition()
            .ok_or_else(|| AppError::BadRequest("Missing content disposition".to_string()))?;
        let is_upload = content_disposition.get_name() == Some(UPLOAD_FIELD);
        let filename = content_disposition.get_filename().map(str::to_string);

        if !is_upload || upload.is_some() {
            // Skip unrelated fields; the multipart stream still has to be consumed.
            while let Some(chunk) = field.next().await {
                chunk.map_err(|e| AppError::BadRequest(format!("Multipart error: {}", e)))?;
            }
            continue;
        }

        let filename = filename.unwrap_or_default();
        if !has_mp3_extension(&filename) {
            return Err(AppError::BadRequest(format!(
                "Only MP3 files are accepted, got '{}'",
                filename
            )));
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| AppError::BadRequest(format!("Upload error: {}", e)))?;
            if bytes.len() + chunk.len() > max_upload_bytes {
                return Err(AppError::BadRequest(format!(
                    "File too large (max: {} bytes)",
                    max_upload_bytes
                )));
            }
            bytes.extend_from_slice(&chunk);
        }

        upload = Some((filename, bytes));
    }

    let (filename, bytes) = upload
        .ok_or_else(|| AppError::BadRequest(format!("No '{}' field in upload", UPLOAD_FIELD)))?;
    let size_bytes = bytes.len();

    // Decoding is CPU-bound; keep it off the async workers.
    let sessions = state.sessions.clone();
    let session = web::block(move || -> Result<SessionHandle, AppError> {
        let mut source = tempfile::Builder::new()
            .prefix("synchro_")
            .suffix(".mp3")
            .tempfile()
            .map_err(|e| AppError::Internal(format!("Failed to store upload: {}", e)))?;
        source
            .write_all(&bytes)
            .map_err(|e| AppError::Internal(format!("Failed to store upload: {}", e)))?;

        let decoded = decode_mp3(bytes).map_err(StreamError::from)?;
        let file_info = decoded.file_info(&filename);
        let session = sessions.create(file_info, decoded.samples, decoded.sample_rate, Some(source))?;
        Ok(session)
    })
    .await
    .map_err(|e| AppError::Internal(format!("Upload task failed: {}", e)))??;

    state.record_session_created();
    let total_chunks = session.snapshot().total_chunks;
    info!(
        session_id = %session.id(),
        size_bytes,
        duration_seconds = session.file_info().duration_seconds,
        total_chunks,
        "Upload accepted"
    );

    Ok(HttpResponse::Ok().json(json!({
        "session_id": session.id(),
        "file_info": session.file_info(),
        "total_chunks": total_chunks
    })))
}

/// `GET /api/v1/sessions`
pub async fn list_sessions(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let sessions: Vec<serde_json::Value> = state
        .sessions
        .summaries()
        .into_iter()
        .map(|(session_id, session_state)| {
            json!({
                "session_id": session_id,
                "state": session_state
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "sessions": sessions
    })))
}

/// `GET /api/v1/sessions/{id}/status`
pub async fn session_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_state = state.sessions.status(&path.into_inner())?;
    Ok(HttpResponse::Ok().json(session_state))
}

/// Every record produced so far. `GET /api/v1/sessions/{id}/chunks`
pub async fn session_chunks(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    let session = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| StreamError::SessionNotFound(session_id.clone()))?;

    Ok(HttpResponse::Ok().json(json!({
        "session_id": session_id,
        "total_chunks": session.snapshot().total_chunks,
        "chunks": session.history().snapshot()
    })))
}

/// Terminate a session. Unknown ids are not an error. `DELETE /api/v1/sessions/{id}`
pub async fn delete_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    state.sessions.terminate(&path.into_inner());
    Ok(HttpResponse::NoContent().finish())
}

/// The originally uploaded file. `GET /api/v1/audio/{id}`
pub async fn download_audio(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    let session = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| StreamError::SessionNotFound(session_id.clone()))?;

    let not_available = || AppError::NotFound(format!("Audio for session '{}' is not available", session_id));
    let source = session.source_path().ok_or_else(not_available)?;
    let bytes = tokio::fs::read(&source).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => not_available(),
        _ => AppError::Internal(format!("Failed to read audio: {}", e)),
    })?;

    Ok(HttpResponse::Ok().content_type("audio/mpeg").body(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sequencer::tests::record_at;
    use crate::config::AppConfig;
    use crate::state::tests::test_state;
    use crate::streaming::session::tests::test_file_info;
    use actix_web::{http::StatusCode, test, App};
    use tempfile::NamedTempFile;

    const BOUNDARY: &str = "synchro-test-boundary";

    fn multipart_request(field: &str, filename: &str, content: &[u8]) -> test::TestRequest {
        let mut body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n",
            b = BOUNDARY
        )
        .into_bytes();
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

        test::TestRequest::post()
            .uri("/api/v1/upload")
            .insert_header((
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            ))
            .set_payload(body)
    }

    macro_rules! app_for {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data($state.clone())
                    .service(web::scope("/api/v1").configure(crate::handlers::configure_api)),
            )
            .await
        };
    }

    async fn error_message(resp: actix_web::dev::ServiceResponse) -> String {
        let body: serde_json::Value = test::read_body_json(resp).await;
        body["error"]["message"].as_str().unwrap_or_default().to_string()
    }

    #[actix_web::test]
    async fn test_upload_rejects_non_mp3() {
        let state = web::Data::new(test_state(AppConfig::default()));
        let app = app_for!(state);

        let resp = test::call_service(&app, multipart_request("file", "notes.txt", b"hello").to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(error_message(resp).await.contains("Only MP3"));

        // right extension, not an MP3 stream
        let resp = test::call_service(
            &app,
            multipart_request("file", "fake.mp3", &[0u8; 64]).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.sessions.active_count(), 0);
    }

    #[actix_web::test]
    async fn test_upload_limits_and_missing_field() {
        let mut config = AppConfig::default();
        config.performance.max_upload_bytes = 16;
        let state = web::Data::new(test_state(config));
        let app = app_for!(state);

        let resp = test::call_service(
            &app,
            multipart_request("file", "big.mp3", &[1u8; 64]).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(error_message(resp).await.contains("too large"));

        let resp = test::call_service(
            &app,
            multipart_request("attachment", "song.mp3", b"abc").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(error_message(resp).await.contains("No 'file' field"));
    }

    #[actix_web::test]
    async fn test_session_queries() {
        let state = web::Data::new(test_state(AppConfig::default()));
        let session = state
            .sessions
            .create(test_file_info(1.0), vec![0.1; 44100], 44100, None)
            .unwrap();
        session.history().append(record_at(0.0, 0.3));
        session.history().append(record_at(0.2, 0.4));
        let app = app_for!(state);

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/sessions/{}/status", session.id()))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "ready");
        assert_eq!(body["total_chunks"], 5);

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/sessions/{}/chunks", session.id()))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["session_id"], session.id());
        assert_eq!(body["chunks"].as_array().unwrap().len(), 2);

        let req = test::TestRequest::get().uri("/api/v1/sessions").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["sessions"][0]["session_id"], session.id());

        for path in ["/api/v1/sessions/nope/status", "/api/v1/sessions/nope/chunks"] {
            let resp = test::call_service(&app, test::TestRequest::get().uri(path).to_request()).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        }
    }

    #[actix_web::test]
    async fn test_delete_is_idempotent() {
        let state = web::Data::new(test_state(AppConfig::default()));
        let session = state
            .sessions
            .create(test_file_info(1.0), vec![0.1; 1000], 1000, None)
            .unwrap();
        let app = app_for!(state);

        let uri = format!("/api/v1/sessions/{}", session.id());
        for _ in 0..2 {
            let resp = test::call_service(&app, test::TestRequest::delete().uri(&uri).to_request()).await;
            assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        }
        assert!(session.is_released());
        assert_eq!(state.sessions.active_count(), 0);
    }

    #[actix_web::test]
    async fn test_download_audio() {
        let state = web::Data::new(test_state(AppConfig::default()));
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"ID3 fake mp3 bytes").unwrap();
        let with_file = state
            .sessions
            .create(test_file_info(1.0), vec![0.1; 1000], 1000, Some(file))
            .unwrap();
        let without_file = state
            .sessions
            .create(test_file_info(1.0), vec![0.1; 1000], 1000, None)
            .unwrap();
        let app = app_for!(state);

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/audio/{}", with_file.id()))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("content-type").unwrap(), "audio/mpeg");
        assert_eq!(test::read_body(resp).await.as_ref(), &b"ID3 fake mp3 bytes"[..]);

        for id in [without_file.id(), "unknown"] {
            let req = test::TestRequest::get().uri(&format!("/api/v1/audio/{}", id)).to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        }
    }
}
