//! Error taxonomy shared by every gateway component.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire code reported in the `reason` field of a failed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    NotFound,
    LimitReached,
    RateLimited,
    UpstreamError,
    Internal,
}

impl ErrorKind {
    pub fn status_code(self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::LimitReached => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::RateLimited => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::UpstreamError => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Cloneable so that one single-flight outcome can be handed to every waiter.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("nothing usable found: {0}")]
    NotFound(String),

    #[error("daily limit reached ({used}/{limit}), retry in {retry_after_secs}s")]
    LimitReached {
        used: u32,
        limit: u32,
        retry_after_secs: u64,
    },

    #[error("upstream is rate limited, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Validation(_) => ErrorKind::Validation,
            GatewayError::NotFound(_) => ErrorKind::NotFound,
            GatewayError::LimitReached { .. } => ErrorKind::LimitReached,
            GatewayError::RateLimited { .. } => ErrorKind::RateLimited,
            GatewayError::Upstream(_) => ErrorKind::UpstreamError,
            GatewayError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Retry hint in seconds; only the two retryable kinds carry one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::LimitReached {
                retry_after_secs, ..
            }
            | GatewayError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.kind().status_code()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
