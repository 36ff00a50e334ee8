use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::fmt;

use super::ApiResponse;
use crate::platform::PlatformError;
use crate::services::{AuthError, ProxyError, UserError};

#[derive(Debug)]
pub enum ApiError {
    Unauthenticated(String),

    Forbidden(String),

    NotFound(String),

    ValidationError(String),

    InvalidOperation(String),

    Conflict(String),

    /// Platform failure; the message is passed through unchanged.
    Upstream(String),

    DatabaseError(String),

    InternalError(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthenticated(msg) => write!(f, "Unauthenticated: {msg}"),
            Self::Forbidden(msg) => write!(f, "Forbidden: {msg}"),
            Self::NotFound(msg) => write!(f, "Not found: {msg}"),
            Self::ValidationError(msg) => write!(f, "Validation error: {msg}"),
            Self::InvalidOperation(msg) => write!(f, "Invalid operation: {msg}"),
            Self::Conflict(msg) => write!(f, "Conflict: {msg}"),
            Self::Upstream(msg) => write!(f, "Platform error: {msg}"),
            Self::DatabaseError(msg) => write!(f, "Database error: {msg}"),
            Self::InternalError(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            Self::Unauthenticated(msg) => (StatusCode::UNAUTHORIZED, msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::ValidationError(msg) | Self::InvalidOperation(msg) | Self::Conflict(msg) => {
                (StatusCode::BAD_REQUEST, msg)
            }
            Self::Upstream(msg) => {
                tracing::warn!("Platform error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
            Self::DatabaseError(msg) => {
                tracing::error!("Database error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "A database error occurred".to_string(),
                )
            }
            Self::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ApiResponse::<()>::error(error_message);
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::InternalError(format!("{err:#}"))
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials => Self::Unauthenticated(err.to_string()),
            AuthError::Unauthenticated(msg) => Self::Unauthenticated(msg),
            AuthError::Validation(msg) => Self::ValidationError(msg),
            AuthError::Database(msg) => Self::DatabaseError(msg),
            AuthError::Internal(msg) => Self::InternalError(msg),
        }
    }
}

impl From<UserError> for ApiError {
    fn from(err: UserError) -> Self {
        match err {
            UserError::DuplicateUsername(_) => Self::Conflict(err.to_string()),
            UserError::WrongCurrentPassword => Self::ValidationError(err.to_string()),
            UserError::NotFound(_) => Self::NotFound(err.to_string()),
            UserError::InvalidOperation(msg) => Self::InvalidOperation(msg),
            UserError::Validation(msg) => Self::ValidationError(msg),
            UserError::Database(msg) => Self::DatabaseError(msg),
        }
    }
}

impl From<PlatformError> for ApiError {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::InvalidEndpoint(_) => Self::ValidationError(err.to_string()),
            PlatformError::NotFound(_) => Self::NotFound(err.to_string()),
            PlatformError::AuthRejected(_)
            | PlatformError::Unreachable(_)
            | PlatformError::TaskFailed(_)
            | PlatformError::TaskTimeout { .. }
            | PlatformError::Upstream(_) => Self::Upstream(err.to_string()),
        }
    }
}

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::InvalidInput(msg) => Self::ValidationError(msg),
            ProxyError::Forbidden(_) => Self::Forbidden(err.to_string()),
            ProxyError::VmNotFound(_) => Self::NotFound(err.to_string()),
            ProxyError::Platform(inner) => inner.into(),
        }
    }
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::Unauthenticated(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let cases = [
            (ApiError::unauthenticated("x"), StatusCode::UNAUTHORIZED),
            (ApiError::forbidden("x"), StatusCode::FORBIDDEN),
            (UserError::DuplicateUsername("a".into()).into(), StatusCode::BAD_REQUEST),
            (UserError::WrongCurrentPassword.into(), StatusCode::BAD_REQUEST),
            (UserError::NotFound("a".into()).into(), StatusCode::NOT_FOUND),
            (
                PlatformError::InvalidEndpoint("x".into()).into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                PlatformError::TaskFailed("disk full".into()).into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ProxyError::Forbidden("vm-1".into()).into(),
                StatusCode::FORBIDDEN,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn upstream_message_is_verbatim() {
        let err: ApiError = PlatformError::TaskFailed("Insufficient disk space".into()).into();
        assert!(matches!(&err, ApiError::Upstream(msg) if msg == "Insufficient disk space"));
    }
}
