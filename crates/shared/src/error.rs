use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    TransientNetwork,
    RateLimited,
    PermissionDenied,
    NotFound,
    Protocol,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Client-side failure taxonomy. Errors that have a safe local fallback are
/// recovered where they occur; everything surfaced through this type is the
/// single human-readable signal the UI layer shows.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transient network failure: {0}")]
    TransientNetwork(String),
    #[error("rate limited: {0}")]
    RateLimited(&'static str),
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::TransientNetwork(_) => ErrorCode::TransientNetwork,
            SyncError::RateLimited(_) => ErrorCode::RateLimited,
            SyncError::PermissionDenied => ErrorCode::PermissionDenied,
            SyncError::Protocol(_) => ErrorCode::Protocol,
            SyncError::NotFound(_) => ErrorCode::NotFound,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_))
    }
}

impl From<SyncError> for ApiError {
    fn from(value: SyncError) -> Self {
        Self {
            code: value.code(),
            message: value.to_string(),
        }
    }
}
