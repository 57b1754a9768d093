//! The gateway's single HTTP-boundary error type.
//!
//! Grounded on the teacher's per-module `thiserror::Error` enums
//! (`auth::middleware::AuthError`) and their `IntoResponse` impls, unified
//! here into one type with the fixed `ErrorKind` enumeration so every module
//! maps its leaf errors through `From` instead of reimplementing
//! `IntoResponse` per module — the teacher's own design notes flag this
//! repetition as worth collapsing.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthorized,
    TwoFactorRequired,
    TwoFactorInvalid,
    Forbidden,
    NotFound,
    Conflict,
    RateLimited,
    QuotaExceeded,
    PayloadTooLarge,
    UpstreamUnhealthy,
    UpstreamUnavailable,
    UpstreamTimeout,
    UpstreamProtocolError,
    ConfigRejected,
    Internal,
}

impl ErrorKind {
    fn status(self) -> StatusCode {
        match self {
            ErrorKind::Unauthorized | ErrorKind::TwoFactorRequired | ErrorKind::TwoFactorInvalid => {
                StatusCode::UNAUTHORIZED
            }
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::UpstreamUnhealthy
            | ErrorKind::UpstreamUnavailable
            | ErrorKind::UpstreamTimeout
            | ErrorKind::UpstreamProtocolError => StatusCode::BAD_GATEWAY,
            ErrorKind::ConfigRejected => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// The error returned to callers. `message` is always safe to show a
/// client; anything sensitive goes to `tracing::error!` at the construction
/// site instead, never into this struct.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub correlation_id: Option<Uuid>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn internal(context: &str, err: impl std::fmt::Display) -> Self {
        let id = Uuid::new_v4();
        tracing::error!(correlation_id = %id, context, error = %err, "internal error");
        Self::new(ErrorKind::Internal, "an internal error occurred").with_correlation(id)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    kind: ErrorKind,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<Uuid>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        let body = ErrorBody {
            kind: self.kind,
            message: self.message,
            correlation_id: self.correlation_id,
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::new(ErrorKind::NotFound, "resource not found"),
            other => ApiError::internal("database", other),
        }
    }
}

impl From<plexmcp_shared::PolicyError> for ApiError {
    fn from(err: plexmcp_shared::PolicyError) -> Self {
        use plexmcp_shared::PolicyError;
        match err {
            PolicyError::ContextMissing => {
                ApiError::new(ErrorKind::Unauthorized, "no organization context resolved")
            }
            PolicyError::PermissionDenied { .. } | PolicyError::ElevationDenied { .. } => {
                ApiError::new(ErrorKind::Forbidden, "insufficient permissions")
            }
        }
    }
}

impl From<plexmcp_quota::QuotaError> for ApiError {
    fn from(err: plexmcp_quota::QuotaError) -> Self {
        ApiError::internal("quota", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_maps_to_429() {
        assert_eq!(ErrorKind::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ErrorKind::QuotaExceeded.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn upstream_errors_map_to_bad_gateway() {
        for kind in [
            ErrorKind::UpstreamUnhealthy,
            ErrorKind::UpstreamUnavailable,
            ErrorKind::UpstreamTimeout,
            ErrorKind::UpstreamProtocolError,
        ] {
            assert_eq!(kind.status(), StatusCode::BAD_GATEWAY);
        }
    }

    #[test]
    fn internal_always_attaches_a_correlation_id() {
        let err = ApiError::internal("test", "boom");
        assert!(err.correlation_id.is_some());
    }
}
