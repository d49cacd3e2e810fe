//! # Error Handling
//!
//! Error types for the HTTP layer and for the model/job services behind it,
//! and how they are converted into JSON HTTP responses.
//!
//! ## Error Categories:
//! - **Request problems**: `BadRequest`, `ValidationError`, `NotFound` (4xx)
//! - **Job lifecycle**: `AlreadyRunning` when a model or transcription already
//!   has a job in flight (409)
//! - **Pre-flight checks**: `NetworkUnavailable` when the model hub cannot be
//!   reached before a download starts (503)
//! - **Static metadata**: `CatalogUnavailable` when the model catalog or
//!   language table is missing or corrupt (500)
//! - **Server problems**: `Internal`, `ConfigError` (500)
//!
//! Errors that happen *inside* a running job never surface here; they are
//! reported on the event stream instead (see `jobs::JobError`).

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Custom error types for the application.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::AlreadyRunning("large-v3".to_string()));
/// ```
#[derive(Debug, Error)]
pub enum AppError {
    /// Internal server errors (filesystem failures, task failures, etc.)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Client sent invalid or malformed data
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Requested model, language or job was not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration file or environment variable problems
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// User input failed validation rules
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A job for this resource is already in flight
    #[error("A job for '{0}' is already running")]
    AlreadyRunning(String),

    /// The remote model hub could not be reached
    #[error("{0}")]
    NetworkUnavailable(String),

    /// The model catalog or language table could not be read
    #[error("Model catalog unavailable: {0}")]
    CatalogUnavailable(String),
}

impl AppError {
    /// Machine-readable error type used in JSON responses.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::ConfigError(_) => "config_error",
            AppError::ValidationError(_) => "validation_error",
            AppError::AlreadyRunning(_) => "already_running",
            AppError::NetworkUnavailable(_) => "network_unavailable",
            AppError::CatalogUnavailable(_) => "catalog_unavailable",
        }
    }
}

/// Converts errors into HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "already_running",
///     "message": "A job for 'large-v3' is already running",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::AlreadyRunning(_) => StatusCode::CONFLICT,
            AppError::NetworkUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) | AppError::ConfigError(_) | AppError::CatalogUnavailable(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Any `anyhow` error that reaches a handler is a server-side failure.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always due to the client sending malformed data.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
