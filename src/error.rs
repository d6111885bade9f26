//! Crate-level error types.
//!
//! Operator-facing endpoints use this; the inference path has its own
//! dialect-aware error rendering in `server`.

#![allow(dead_code)]

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Database(e) => {
                crate::logger::error("server", &format!("database error: {}", e));
                (StatusCode::INTERNAL_SERVER_ERROR, "Database operation failed".to_string())
            }
            AppError::Io(e) => {
                crate::logger::error("server", &format!("io error: {}", e));
                (StatusCode::INTERNAL_SERVER_ERROR, "File operation failed".to_string())
            }
            AppError::Json(e) => {
                crate::logger::error("server", &format!("json error: {}", e));
                (StatusCode::INTERNAL_SERVER_ERROR, "Serialization failed".to_string())
            }
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Internal(msg) => {
                crate::logger::error("server", &format!("internal error: {}", msg));
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
        };
        let body = Json(ErrorResponse {
            error: status.as_u16().to_string(),
            message,
        });
        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
