// Error handling module
// Credential lifecycle errors and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures of the credential lifecycle
///
/// Every variant is fail-closed: callers treat it as "not authenticated".
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    /// Token payload could not be decoded
    #[error("Malformed token: {0}")]
    Decode(String),

    /// No record stored under the active provider key
    #[error("No credentials stored")]
    NoCredentials,

    /// Record present but not a complete token pair
    #[error("Malformed credential record: {0}")]
    MalformedRecord(String),

    /// Every refresh attempt failed
    #[error("Token refresh exhausted after {attempts} attempt(s)")]
    RefreshExhausted { attempts: u32 },

    /// Proactive or reactive refresh did not produce a usable token
    #[error("Token refresh failed")]
    RefreshFailed,

    /// Upstream answered the validation call with a non-success status
    #[error("Credentials rejected with status {status}")]
    Rejected { status: u16 },

    /// Cache or network unreachable
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request body cannot be replayed for a retry
    #[error("Request body is not cloneable")]
    UnclonableRequest,
}

impl AuthError {
    /// Machine-readable reason carried on the login redirect
    pub fn error_code(&self) -> &'static str {
        match self {
            // Corrupt records are indistinguishable from absent ones for the caller
            AuthError::NoCredentials | AuthError::MalformedRecord(_) => "credentials_required",
            AuthError::Decode(_)
            | AuthError::RefreshExhausted { .. }
            | AuthError::RefreshFailed => "session_expired",
            AuthError::Rejected { .. } => "session_invalid",
            AuthError::Transport(_) | AuthError::UnclonableRequest => "service_unavailable",
        }
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            "timeout"
        } else if e.is_connect() {
            "connection_failed"
        } else if e.is_decode() {
            "decode_error"
        } else {
            "request_error"
        };
        AuthError::Transport(format!("{} ({})", e, kind))
    }
}

/// API errors that can occur during request processing
#[derive(Error, Debug)]
pub enum ApiError {
    /// Caller failed cache API key authentication
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Credential lifecycle failure
    #[error(transparent)]
    Credential(#[from] AuthError),

    /// Request validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::AuthError(msg) => (StatusCode::UNAUTHORIZED, "auth_error", msg),
            ApiError::Credential(err) => {
                let status = match err {
                    AuthError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::UNAUTHORIZED,
                };
                (status, err.error_code(), err.to_string())
            }
            ApiError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            ApiError::Internal(err) => {
                tracing::error!("Internal error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, ApiError>;
