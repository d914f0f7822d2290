//! API error type and its HTTP projection.
//!
//! Handlers recover nothing silently: storage and broker faults are logged
//! with context and surface as a generic 500, everything else maps to the
//! status code the client is expected to act on.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use agentvault_core::{AgentStatus, StoreError};

use crate::objectstore::ObjectStoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("missing Authorization header")]
    AuthMissing,

    #[error("invalid token")]
    AuthInvalid,

    #[error("quota exceeded: used {used} + new {new} > quota {quota} bytes")]
    QuotaExceeded { used: i64, new: i64, quota: i64 },

    #[error("agent not active")]
    NotActive { status: AgentStatus },

    #[error("{0}")]
    NotFound(&'static str),

    #[error("rate limit exceeded, try again later")]
    RateLimited,

    #[error("backup interval not elapsed, try again later")]
    TooFrequent,

    #[error("too many pending registrations, try again later")]
    PendingFlood,

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] ObjectStoreError),
}

fn error_body(message: &str) -> Json<serde_json::Value> {
    Json(json!({ "error": message }))
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Validation(ref message) => {
                (StatusCode::BAD_REQUEST, error_body(message)).into_response()
            }
            Self::AuthMissing | Self::AuthInvalid => {
                (StatusCode::UNAUTHORIZED, error_body(&self.to_string())).into_response()
            }
            Self::QuotaExceeded { .. } => {
                (StatusCode::FORBIDDEN, error_body(&self.to_string())).into_response()
            }
            Self::NotActive { status } => (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": "agent not active", "status": status })),
            )
                .into_response(),
            Self::NotFound(message) => {
                (StatusCode::NOT_FOUND, error_body(message)).into_response()
            }
            Self::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, "60")],
                error_body(&self.to_string()),
            )
                .into_response(),
            Self::TooFrequent => {
                (StatusCode::TOO_MANY_REQUESTS, error_body(&self.to_string())).into_response()
            }
            Self::PendingFlood => {
                (StatusCode::SERVICE_UNAVAILABLE, error_body(&self.to_string())).into_response()
            }
            Self::Storage(ref cause) => {
                error!(%cause, "storage error while handling request");
                (StatusCode::INTERNAL_SERVER_ERROR, error_body("internal error")).into_response()
            }
            Self::Broker(ref cause) => {
                error!(%cause, "object-store error while handling request");
                (StatusCode::INTERNAL_SERVER_ERROR, error_body("internal error")).into_response()
            }
        }
    }
}

impl ApiError {
    /// Map a store miss onto a 404 with the given message, passing other
    /// storage faults through as 500s.
    pub fn not_found_or_storage(err: StoreError, message: &'static str) -> Self {
        match err {
            StoreError::NotFound(_) => Self::NotFound(message),
            other => Self::Storage(other),
        }
    }
}
