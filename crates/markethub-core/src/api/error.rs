use std::fmt;

use serde::Deserialize;
use thiserror::Error;

/// Every failure the API client can surface to a caller.
///
/// The type is `Clone` so a single token refresh outcome can be handed to
/// every task awaiting it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Not signed in: {0}")]
    TokenAcquisitionFailed(String),

    #[error("Unauthorized - please sign in again")]
    Unauthorized,

    #[error("Network error: {0}")]
    NetworkFailure(String),

    #[error("Request rejected ({status}): {message}")]
    ServerRejected { status: u16, message: String },

    #[error("Invalid response: {0}")]
    MalformedResponse(String),

    /// The request could not be built (bad URL, bad part content type).
    /// Nothing was sent and resending the same request cannot succeed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Discriminant of [`ApiError`], for callers that route on the failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TokenAcquisitionFailed,
    Unauthorized,
    NetworkFailure,
    ServerRejected,
    MalformedResponse,
    InvalidRequest,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::TokenAcquisitionFailed => "token_acquisition_failed",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::NetworkFailure => "network_failure",
            ErrorKind::ServerRejected => "server_rejected",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::InvalidRequest => "invalid_request",
        };
        f.write_str(name)
    }
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Structured error body returned by the backend. `message` is the
/// documented field; some endpoints only send `error`.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::TokenAcquisitionFailed(_) => ErrorKind::TokenAcquisitionFailed,
            ApiError::Unauthorized => ErrorKind::Unauthorized,
            ApiError::NetworkFailure(_) => ErrorKind::NetworkFailure,
            ApiError::ServerRejected { .. } => ErrorKind::ServerRejected,
            ApiError::MalformedResponse(_) => ErrorKind::MalformedResponse,
            ApiError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    /// Whether the caller may retry the whole operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::NetworkFailure(_))
    }

    /// Whether the caller has to send the user back through sign-in.
    pub fn requires_sign_in(&self) -> bool {
        matches!(
            self,
            ApiError::TokenAcquisitionFailed(_) | ApiError::Unauthorized
        )
    }

    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    fn generic_message(status: u16) -> String {
        let text = match status {
            400 => "Bad request",
            403 => "Access denied",
            404 => "Resource not found",
            409 => "Conflict with the current state of the resource",
            422 => "Validation failed",
            429 => "Rate limited - please wait before retrying",
            500..=599 => "Server error - please try again later",
            _ => "Request failed",
        };
        format!("{} (HTTP {})", text, status)
    }

    /// Classify a non-success response.
    ///
    /// 401 is mapped to `Unauthorized`; everything else becomes
    /// `ServerRejected` with the server's message when the body carries one.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let code = status.as_u16();
        if code == 401 {
            return ApiError::Unauthorized;
        }

        let message = serde_json::from_str::<ErrorBody>(body)
            .ok()
            .and_then(|b| b.message.or(b.error))
            .filter(|m| !m.trim().is_empty())
            .map(|m| Self::truncate_body(&m))
            .unwrap_or_else(|| Self::generic_message(code));

        ApiError::ServerRejected {
            status: code,
            message,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::NetworkFailure(format!("request timed out: {}", err))
        } else {
            ApiError::NetworkFailure(err.to_string())
        }
    }
}
