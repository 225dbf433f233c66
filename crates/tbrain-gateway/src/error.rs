//! Error types for the TBrain gateway.
//!
//! Uses `thiserror` for structured error handling. Every error renders as the
//! uniform JSON envelope `{"error": {"code", "message", "correlationId"}}`;
//! the HTTP status drives the code mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::http::header::{HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, SecondsFormat, Utc};

/// Errors surfaced by the authentication and dispatch layer.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    /// Malformed or missing request parameters (400)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown, consumed, or expired grant (400)
    #[error("invalid grant: {0}")]
    InvalidGrant(String),

    /// Client is not in the allow-list (400)
    #[error("unauthorized client: {0}")]
    UnauthorizedClient(String),

    /// Missing or invalid credential (401)
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Valid credential, insufficient permission (403)
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Double-submit token missing or mismatched (403)
    #[error("CSRF validation failed: {0}")]
    Csrf(String),

    /// No such route or resource (404)
    #[error("not found: {0}")]
    NotFound(String),

    /// Conflicting state (409)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Fixed-window request limit exhausted (429)
    #[error("rate limit exceeded, retry after {retry_after}s")]
    RateLimited {
        /// Seconds until the current window resets (always >= 1)
        retry_after: u64,
        /// Configured per-window request limit
        limit: u32,
        /// When the current window resets
        reset_at: DateTime<Utc>,
    },

    /// Unexpected local or remote failure (500). The message is logged with
    /// full context but never sent to the caller.
    #[error("internal error: {0}")]
    Internal(String),

    /// Dependency not ready (503)
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    /// Create an invalid request error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Create an invalid grant error.
    #[must_use]
    pub fn invalid_grant(message: impl Into<String>) -> Self {
        Self::InvalidGrant(message.into())
    }

    /// Create an unauthorized (missing/invalid credential) error.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    /// Create a forbidden (insufficient permission) error.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    /// Create a not found error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Stable error code from the gateway taxonomy.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidGrant(_) => "invalid_grant",
            Self::UnauthorizedClient(_) => "unauthorized_client",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Csrf(_) => "csrf_error",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::RateLimited { .. } => "rate_limit_exceeded",
            Self::Internal(_) => "server_error",
            Self::Unavailable(_) => "service_unavailable",
        }
    }

    /// HTTP status for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::InvalidGrant(_) | Self::UnauthorizedClient(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) | Self::Csrf(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Message safe to expose to the caller.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            // Never leak remote failures or stack context to the caller.
            Self::Internal(_) => "An internal error occurred".to_owned(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let correlation_id = uuid::Uuid::new_v4().to_string();

        match &self {
            GatewayError::Internal(message) => {
                tracing::error!(correlation_id = %correlation_id, error = %message, "Internal error");
            }
            other => {
                tracing::debug!(correlation_id = %correlation_id, code = other.code(), "Request rejected");
            }
        }

        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.public_message(),
                "correlationId": correlation_id,
            }
        });

        let mut response = (self.status(), Json(body)).into_response();

        if let Self::RateLimited { retry_after, limit, reset_at } = &self {
            let headers = response.headers_mut();
            insert_header(headers, "Retry-After", &retry_after.to_string());
            insert_header(headers, "X-RateLimit-Limit", &limit.to_string());
            insert_header(headers, "X-RateLimit-Remaining", "0");
            insert_header(
                headers,
                "X-RateLimit-Reset",
                &reset_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            );
        }

        response
    }
}

/// Insert a header, silently skipping values that are not valid header text.
pub(crate) fn insert_header(headers: &mut axum::http::HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) =
        (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value))
    {
        headers.insert(name, value);
    }
}

/// Result type alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
