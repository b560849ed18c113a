//! # Error Handling
//!
//! This module defines the two error layers of the service and how they relate:
//!
//! - **StreamError**: domain errors raised by the streaming engine (session registry,
//!   production task, delivery protocol). Built with `thiserror` so every variant
//!   carries a readable message and can wrap its source.
//! - **AppError**: HTTP-facing errors. Each variant maps to a status code and a
//!   consistent JSON body through actix-web's `ResponseError` trait.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Result<T, E> Type
//! - **T**: The success type (what you get when everything works)
//! - **E**: The error type (what you get when something goes wrong)
//! - **No exceptions**: Rust doesn't have try/catch, it uses Result instead
//!
//! ### Traits for Error Conversion
//! - **From trait**: Automatically converts between error types (this is what makes `?` work)
//! - **ResponseError trait**: Converts errors to HTTP responses
//! - **Display trait**: Defines how errors are formatted as strings

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait
use thiserror::Error;

/// Errors raised by the streaming engine.
///
/// ## Error Categories:
/// - **InvalidInput**: bad upload or bad parameters, rejected before a session exists
/// - **SessionNotFound**: any operation on an unknown or already torn down session
/// - **ProductionFailure**: the feature extractor or chunk sequencer failed mid-stream
/// - **ConnectionLost**: the client went away; treated as a normal teardown trigger
/// - **Cancelled**: the production task observed its cancellation token
/// - **CapacityExceeded**: the concurrent session limit is reached
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StreamError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("production failed: {0}")]
    ProductionFailure(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("production cancelled")]
    Cancelled,

    #[error("maximum concurrent sessions ({0}) reached")]
    CapacityExceeded(usize),
}

/// Custom error types for the HTTP layer.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **ServiceUnavailable**: The server is at capacity (503 errors)
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::BadRequest("Only MP3 files are accepted".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (task failures, I/O problems, etc.)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// No room for another session right now
    ServiceUnavailable(String),
}

/// Implementation of the Display trait for AppError.
///
/// This is what gets printed when an error is logged with `{}`.
impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Implementation of the ResponseError trait for AppError.
///
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError → 500 (Internal Server Error)
/// - BadRequest/ValidationError → 400 (Bad Request)
/// - NotFound → 404 (Not Found)
/// - ServiceUnavailable → 503 (Service Unavailable)
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "bad_request",
///     "message": "Only MP3 files are accepted",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        // Map each error type to HTTP status code, error type, and message
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,  // 500
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,  // 400
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,  // 404
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,  // 500
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,  // 400
                "validation_error",
                msg.clone(),
            ),
            AppError::ServiceUnavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,  // 503
                "service_unavailable",
                msg.clone(),
            ),
        };

        // Build the HTTP response with JSON body
        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,           // Machine-readable error type
                "message": message,           // Human-readable error message
                "timestamp": chrono::Utc::now().to_rfc3339()  // When the error occurred
            }
        }))
    }
}

/// Domain errors surface to HTTP clients through this conversion.
///
/// ## Mapping:
/// - InvalidInput → 400, the upload or parameters were rejected
/// - SessionNotFound → 404
/// - CapacityExceeded → 503, the client may retry later
/// - everything else → 500
impl From<StreamError> for AppError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::InvalidInput(msg) => AppError::BadRequest(msg),
            StreamError::SessionNotFound(id) => AppError::NotFound(format!("Session '{}' not found", id)),
            StreamError::CapacityExceeded(limit) => AppError::ServiceUnavailable(format!(
                "Maximum concurrent sessions ({}) reached, try again later",
                limit
            )),
            other => AppError::Internal(other.to_string()),
        }
    }
}

/// Automatic conversion from anyhow::Error to AppError.
///
/// When you use `?` with an anyhow::Error, it automatically becomes an AppError::Internal.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Automatic conversion from JSON parsing errors to AppError.
///
/// ## Why BadRequest:
/// JSON parsing errors are almost always due to the client sending malformed data,
/// so they should result in a 400 (Bad Request) response, not a 500.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

/// Automatic conversion from configuration errors to AppError.
///
/// ## When this happens:
/// - config.toml file has invalid syntax
/// - An environment variable cannot be parsed into the expected type
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Type alias for Results that use our custom error type.
///
/// ## Usage Example:
/// ```rust,ignore
/// async fn session_status(...) -> AppResult<HttpResponse> { ... }
/// ```
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_stream_error_status_mapping() {
        let cases = [
            (StreamError::InvalidInput("not an mp3".to_string()), StatusCode::BAD_REQUEST),
            (StreamError::SessionNotFound("session_x".to_string()), StatusCode::NOT_FOUND),
            (StreamError::CapacityExceeded(4), StatusCode::SERVICE_UNAVAILABLE),
            (StreamError::ProductionFailure("boom".to_string()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (stream_error, expected) in cases {
            let app_error = AppError::from(stream_error);
            assert_eq!(app_error.error_response().status(), expected);
        }
    }

    #[test]
    fn test_session_not_found_message_names_the_session() {
        let app_error = AppError::from(StreamError::SessionNotFound("session_42".to_string()));
        assert!(app_error.to_string().contains("session_42"));
    }
}
