// Error handling module
// Defines the session error taxonomy and user-facing messages

use reqwest::StatusCode;
use thiserror::Error;

/// Maximum length for error response bodies kept in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Errors surfaced by the session manager and the authorization pipeline.
///
/// Variants carry owned strings so a single refresh outcome can be handed
/// to every request that was waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    /// Login rejected by the backend
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Registration rejected because the address is taken
    #[error("Email already in use: {0}")]
    EmailAlreadyInUse(String),

    /// No refresh token is held for the current session
    #[error("No refresh token available")]
    RefreshUnavailable,

    /// Backend rejected the refresh, or it did not finish in time
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    /// Stored user record could not be parsed
    #[error("Corrupted persisted state: {0}")]
    CorruptedPersistedState(String),

    /// 401 that a refresh could not resolve
    #[error("Unauthorized - session is no longer valid")]
    Unauthorized,

    /// Any other non-success HTTP status
    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    /// Transport-level failure (connect, timeout, body)
    #[error("Network error: {0}")]
    Network(String),

    /// Request body is a stream and cannot be replayed after a refresh
    #[error("Request body is not cloneable")]
    RequestNotReplayable,

    /// Response body did not match the expected shape
    #[error("Invalid response: {0}")]
    Decode(String),
}

impl AuthError {
    /// Build an error from a non-success status and its raw body.
    /// Prefers the server's `message` (or `error`) field when the body is JSON.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        match status.as_u16() {
            401 => AuthError::Unauthorized,
            code => AuthError::Server {
                status: code,
                message: server_message(body),
            },
        }
    }

    /// Categorise a reqwest transport error for logs and messages
    pub fn from_transport(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            "timeout"
        } else if err.is_connect() {
            "connection_failed"
        } else if err.is_decode() {
            "decode_error"
        } else if err.is_body() {
            "body_error"
        } else if err.is_request() {
            "request_error"
        } else {
            "unknown"
        };

        if kind == "decode_error" {
            AuthError::Decode(err.to_string())
        } else {
            AuthError::Network(format!("{} (kind: {})", err, kind))
        }
    }

    /// True when this error ends the session
    pub fn forces_logout(&self) -> bool {
        matches!(
            self,
            AuthError::RefreshUnavailable | AuthError::RefreshFailed(_) | AuthError::Unauthorized
        )
    }

    /// Message suitable for showing inline to the user
    pub fn user_message(&self) -> String {
        match self {
            AuthError::InvalidCredentials(msg) | AuthError::EmailAlreadyInUse(msg) => msg.clone(),
            AuthError::RefreshUnavailable
            | AuthError::RefreshFailed(_)
            | AuthError::Unauthorized => "Your session has expired. Please log in again.".to_string(),
            AuthError::CorruptedPersistedState(_) => {
                "Stored session data was invalid and has been cleared.".to_string()
            }
            AuthError::Server { message, .. } if !message.is_empty() => message.clone(),
            AuthError::Server { status, .. } => match status {
                400 => "Bad request. Please check your input.".to_string(),
                403 => "Forbidden. You do not have permission to access this resource.".to_string(),
                404 => "Resource not found.".to_string(),
                500 => "Server error. Please try again later.".to_string(),
                other => format!("Error Code: {}", other),
            },
            AuthError::Network(_) => {
                "Unable to reach the bookstore. Check your connection and try again.".to_string()
            }
            AuthError::RequestNotReplayable | AuthError::Decode(_) => {
                "Something went wrong. Please try again.".to_string()
            }
        }
    }
}

/// Pull a human-readable message out of an error body
pub fn server_message(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        for field in ["message", "error"] {
            if let Some(msg) = json.get(field).and_then(|v| v.as_str()) {
                return msg.to_string();
            }
        }
    }
    truncate_body(body.trim())
}

/// Truncate a response body to avoid logging excessive data
fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = AuthError::InvalidCredentials("Invalid email or password".to_string());
        assert_eq!(err.to_string(), "Invalid credentials: Invalid email or password");

        let err = AuthError::Server {
            status: 429,
            message: "Rate limit exceeded".to_string(),
        };
        assert_eq!(err.to_string(), "Server error: 429 - Rate limit exceeded");

        assert_eq!(
            AuthError::RefreshUnavailable.to_string(),
            "No refresh token available"
        );
    }

    #[test]
    fn test_from_status_prefers_json_message() {
        let err = AuthError::from_status(
            StatusCode::BAD_REQUEST,
            r#"{"message":"Email is already in use!"}"#,
        );
        assert_eq!(
            err,
            AuthError::Server {
                status: 400,
                message: "Email is already in use!".to_string()
            }
        );

        let err = AuthError::from_status(StatusCode::FORBIDDEN, r#"{"error":"Forbidden"}"#);
        assert_eq!(err.user_message(), "Forbidden");
    }

    #[test]
    fn test_from_status_401_is_unauthorized() {
        let err = AuthError::from_status(StatusCode::UNAUTHORIZED, "whatever");
        assert_eq!(err, AuthError::Unauthorized);
        assert!(err.forces_logout());
    }

    #[test]
    fn test_user_message_falls_back_to_status_text() {
        let cases = [
            (400, "Bad request. Please check your input."),
            (403, "Forbidden. You do not have permission to access this resource."),
            (404, "Resource not found."),
            (500, "Server error. Please try again later."),
            (418, "Error Code: 418"),
        ];
        for (status, expected) in cases {
            let err = AuthError::Server {
                status,
                message: String::new(),
            };
            assert_eq!(err.user_message(), expected);
        }
    }

    #[test]
    fn test_refresh_errors_read_as_reauthentication() {
        let msg = AuthError::RefreshFailed("401 Unauthorized".to_string()).user_message();
        assert!(msg.contains("log in again"));
        assert!(!AuthError::Network("down".to_string()).forces_logout());
    }

    #[test]
    fn test_truncate_long_body() {
        let body = "x".repeat(MAX_ERROR_BODY_LENGTH + 20);
        let msg = server_message(&body);
        assert!(msg.starts_with(&"x".repeat(MAX_ERROR_BODY_LENGTH)));
        assert!(msg.contains("truncated"));
    }
}
