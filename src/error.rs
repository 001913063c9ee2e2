//! # Error Handling
//!
//! Custom error types for the ASR service and their conversion to HTTP
//! responses.
//!
//! ## Error Categories:
//! - **Config**: startup-time failures (unsupported engine selector, missing
//!   credential) — these abort the process before any endpoint is reachable
//! - **AudioDecode**: the upload was empty/truncated or the transcoder failed
//! - **InvalidRequest**: option combination not valid for the active engine
//! - **UnsupportedOption**: the engine explicitly rejected an option it does
//!   not implement
//! - **UnknownLanguage**: the engine returned a language code absent from the
//!   language table (deployment inconsistency, not a user error)
//! - **Engine**: opaque inference failure, terminal for the request

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    /// Startup configuration problems (unsupported engine, bad model name)
    Config(String),

    /// Malformed/empty upload or external transcoder failure
    AudioDecode(String),

    /// Request options rejected before reaching the engine
    InvalidRequest(String),

    /// Engine explicitly rejected an option it does not implement.
    /// Carries the name of the offending option.
    UnsupportedOption(String),

    /// Engine returned a language code not present in the language table
    UnknownLanguage(String),

    /// Opaque engine-internal failure; never retried or downgraded
    Engine(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::AudioDecode(msg) => write!(f, "Audio decode error: {}", msg),
            AppError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            AppError::UnsupportedOption(opt) => {
                write!(f, "Option not supported by the active engine: {}", opt)
            }
            AppError::UnknownLanguage(code) => {
                write!(f, "Unknown language code reported by engine: {}", code)
            }
            AppError::Engine(msg) => write!(f, "Engine error: {}", msg),
        }
    }
}

// Needed so streamed response bodies can carry AppError as their error type.
impl std::error::Error for AppError {}

/// Maps each error kind to an HTTP status and a machine-readable type tag.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "invalid_request",
///     "message": "min_speakers (5) greater than max_speakers (2)",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Config(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::AudioDecode(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "audio_decode_error",
                msg.clone(),
            ),
            AppError::InvalidRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "invalid_request",
                msg.clone(),
            ),
            AppError::UnsupportedOption(opt) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "unsupported_option",
                format!("option not supported by the active engine: {}", opt),
            ),
            AppError::UnknownLanguage(code) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "unknown_language_code",
                format!("engine returned a language code not in the table: {}", code),
            ),
            AppError::Engine(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "engine_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Engine(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn validation_errors_map_to_400() {
        let err = AppError::InvalidRequest("min_speakers (5) greater than max_speakers (2)".into());
        assert_eq!(err.error_response().status(), StatusCode::BAD_REQUEST);

        let err = AppError::UnsupportedOption("initial_prompt".into());
        assert_eq!(err.error_response().status(), StatusCode::BAD_REQUEST);

        let err = AppError::AudioDecode("empty upload".into());
        assert_eq!(err.error_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn server_side_errors_map_to_500() {
        let err = AppError::Engine("out of memory".into());
        assert_eq!(err.error_response().status(), StatusCode::INTERNAL_SERVER_ERROR);

        let err = AppError::UnknownLanguage("xx".into());
        assert_eq!(err.error_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
