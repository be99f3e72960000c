// src/error.rs
// Standardized error taxonomy for the gateway

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::access::AccessLevel;

/// Main error type for the gateway. Each variant maps to exactly one HTTP
/// status and a structured body; internal detail never reaches clients.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("malformed request: {0}")]
    Parse(String),

    #[error("authentication required")]
    Auth,

    #[error("access level {} ({}) required", .required.as_u8(), .required.name())]
    Authorization { required: AccessLevel },

    #[error("gateway is off")]
    GatewayOff,

    #[error("{0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cloud plan does not permit this operation")]
    TierDenied,

    #[error("rate limit exceeded")]
    RateLimit { retry_after_secs: Option<u64> },

    #[error("cloud API key is invalid or expired")]
    UpstreamAuth { status: u16 },

    #[error("upstream provider error: {0}")]
    Upstream(String),

    #[error("no API key configured for provider: {0}")]
    ConfigMissing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Parse(_) => StatusCode::BAD_REQUEST,
            Self::Auth => StatusCode::UNAUTHORIZED,
            Self::Authorization { .. } | Self::GatewayOff | Self::TierDenied | Self::Forbidden(_) => {
                StatusCode::FORBIDDEN
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamAuth { status } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::UNAUTHORIZED)
            }
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::ConfigMissing(_) | Self::Io(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Json(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Body message. Auth errors deliberately carry no reason; internal
    /// errors never expose paths or token material.
    fn public_message(&self) -> String {
        match self {
            Self::Auth => "unauthorized".to_string(),
            Self::Authorization { required } => {
                format!(
                    "Access level {} ({}) required",
                    required.as_u8(),
                    required.name()
                )
            }
            Self::GatewayOff => "Gateway is OFF".to_string(),
            Self::UpstreamAuth { .. } => "Cloud API key is invalid or expired".to_string(),
            Self::Io(_) | Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::Parse(_) | Self::Json(_) | Self::NotFound(_) => "invalid_request_error",
            Self::Auth | Self::UpstreamAuth { .. } => "authentication_error",
            Self::Authorization { .. }
            | Self::GatewayOff
            | Self::TierDenied
            | Self::Forbidden(_) => "permission_error",
            Self::RateLimit { .. } => "rate_limit_error",
            Self::Upstream(_) => "upstream_error",
            Self::ConfigMissing(_) => "configuration_error",
            Self::Io(_) | Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Authorization errors keep the flat shape clients match on
        if matches!(
            self,
            Self::Authorization { .. } | Self::GatewayOff | Self::TierDenied | Self::Forbidden(_)
        ) {
            let body = serde_json::json!({ "error": self.public_message() });
            return (status, Json(body)).into_response();
        }

        let mut response = (
            status,
            Json(serde_json::json!({
                "error": {
                    "message": self.public_message(),
                    "type": self.error_type(),
                }
            })),
        )
            .into_response();

        if let Self::RateLimit {
            retry_after_secs: Some(secs),
        } = self
            && let Ok(value) = secs.to_string().parse()
        {
            response.headers_mut().insert("Retry-After", value);
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::Parse("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(GatewayError::Auth.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GatewayError::Authorization {
                required: AccessLevel::Full
            }
            .status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::RateLimit {
                retry_after_secs: None
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::ConfigMissing("anthropic".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_authorization_body_format() {
        let err = GatewayError::Authorization {
            required: AccessLevel::Full,
        };
        assert_eq!(err.public_message(), "Access level 5 (FULL) required");
    }

    #[test]
    fn test_auth_error_leaks_nothing() {
        let err = GatewayError::Auth;
        assert_eq!(err.public_message(), "unauthorized");
    }

    #[test]
    fn test_upstream_auth_message() {
        let err = GatewayError::UpstreamAuth { status: 403 };
        assert_eq!(err.public_message(), "Cloud API key is invalid or expired");
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }
}
