//! Errors raised by the remote API client.

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::util::compact_text;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid API configuration: {0}")]
    InvalidConfiguration(String),

    /// The request never produced a response.
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Credentials were rejected.
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// The library advanced past the version the request was based on.
    #[error("Library version changed on the server")]
    PreconditionFailed,

    #[error("API error {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid API payload: {0}")]
    InvalidPayload(String),
}

impl ApiError {
    /// Builds the error for a non-success response.
    pub(crate) fn from_response(status: StatusCode, body: &str) -> Self {
        let message = parse_error_message(status, body);
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::Unauthorized(message),
            StatusCode::PRECONDITION_FAILED => Self::PreconditionFailed,
            _ => Self::Status {
                status: status.as_u16(),
                message,
            },
        }
    }

    /// Whether repeating the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_error_message(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return compact_text(&message);
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        compact_text(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_variants() {
        assert!(matches!(
            ApiError::from_response(StatusCode::FORBIDDEN, ""),
            ApiError::Unauthorized(_)
        ));
        assert!(matches!(
            ApiError::from_response(StatusCode::PRECONDITION_FAILED, ""),
            ApiError::PreconditionFailed
        ));

        let server = ApiError::from_response(StatusCode::BAD_GATEWAY, "");
        assert!(server.is_transient());
        let client = ApiError::from_response(StatusCode::BAD_REQUEST, r#"{"message":"bad key"}"#);
        assert!(!client.is_transient());
        assert_eq!(client.to_string(), "API error 400: bad key");
    }

    #[test]
    fn empty_body_falls_back_to_status() {
        let error = ApiError::from_response(StatusCode::SERVICE_UNAVAILABLE, "  ");
        assert_eq!(error.to_string(), "API error 503: HTTP 503");
    }
}
