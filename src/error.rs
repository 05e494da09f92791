//! Error types for the Elidune synchronization layer

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Error codes reported in HTTP error bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Failure = 1,
    ConnectionFailure = 2,
    FetchFailure = 3,
    SaveFailure = 4,
    Duplicate = 5,
    BadValue = 6,
    NoSuchData = 7,
}

/// Main application error type.
///
/// Every variant carries its message as a `String` so that a single settled
/// fetch can be cloned out to every caller that was coalesced onto it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// A realtime channel failed to subscribe (retryable per backoff policy)
    #[error("Connection error: {0}")]
    Connection(String),

    /// A one-shot read failed; never retried automatically
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// A one-shot write failed; the local draft is kept for a user retry
    #[error("Save error: {0}")]
    Save(String),

    /// A handle was registered twice under the same subscription key
    #[error("Duplicate subscription: {0}")]
    DuplicateSubscription(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Message without the category prefix, as shown to end users
    pub fn message(&self) -> &str {
        match self {
            AppError::Connection(msg)
            | AppError::Fetch(msg)
            | AppError::Save(msg)
            | AppError::DuplicateSubscription(msg)
            | AppError::Decode(msg)
            | AppError::NotFound(msg)
            | AppError::BadRequest(msg)
            | AppError::Internal(msg) => msg,
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Decode(e.to_string())
    }
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::Internal(format!("Redis error: {}", e))
    }
}

/// Error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub code: u32,
    pub error: String,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Connection(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorCode::ConnectionFailure,
                msg.clone(),
            ),
            AppError::Fetch(msg) => (StatusCode::BAD_GATEWAY, ErrorCode::FetchFailure, msg.clone()),
            AppError::Save(msg) => (StatusCode::BAD_GATEWAY, ErrorCode::SaveFailure, msg.clone()),
            AppError::DuplicateSubscription(msg) => {
                (StatusCode::CONFLICT, ErrorCode::Duplicate, msg.clone())
            }
            AppError::Decode(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, ErrorCode::BadValue, msg.clone())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorCode::NoSuchData, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ErrorCode::BadValue, msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::Failure,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            code: code as u32,
            error: format!("{:?}", code),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for application operations
pub type AppResult<T> = Result<T, AppError>;

/// The `{data, error}` envelope handed to UI callers.
///
/// Exactly one of the two fields is set; the error message is passed through
/// unchanged so the caller can display it or offer a retry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataResponse<T> {
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> DataResponse<T> {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl<T> From<AppResult<T>> for DataResponse<T> {
    fn from(result: AppResult<T>) -> Self {
        match result {
            Ok(data) => Self {
                data: Some(data),
                error: None,
            },
            Err(e) => Self {
                data: None,
                error: Some(e.message().to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_preserves_message() {
        let response: DataResponse<i32> = Err(AppError::Fetch("books table unavailable".into())).into();
        assert_eq!(response.data, None);
        assert_eq!(response.error.as_deref(), Some("books table unavailable"));
        assert!(!response.is_ok());

        let response: DataResponse<i32> = Ok(3).into();
        assert_eq!(response.data, Some(3));
        assert!(response.is_ok());
    }
}
