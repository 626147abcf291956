use serde::{Deserialize, Serialize};

/// Uniform error body returned by every HTTP-level rejection of the gateway.
///
/// WebSocket upgrades that are refused before the handshake completes carry this
/// body, so clients can tell an expired token apart from a membership failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Reason phrase of the HTTP status ("Unauthorized", "Conflict", ...)
    pub error: String,

    /// Human readable description
    pub message: String,

    /// HTTP status code
    pub status: u16,

    /// Error family used by clients for routing, see [`error_types`]
    pub error_type: String,

    /// Stable machine readable code, see [`error_codes`]
    pub code: String,

    /// RFC 3339 timestamp
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, status: u16, error_type: &str, code: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            status,
            error_type: error_type.to_string(),
            code: code.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

pub mod error_codes {
    // Authentication
    pub const TOKEN_INVALID: &str = "TOKEN_INVALID";

    // Conversations
    pub const NOT_CONVERSATION_MEMBER: &str = "NOT_CONVERSATION_MEMBER";
    pub const DUPLICATE_CONNECTION: &str = "DUPLICATE_CONNECTION";

    // Transport
    pub const PUBLISH_FAILED: &str = "PUBLISH_FAILED";
    pub const BROKER_UNAVAILABLE: &str = "BROKER_UNAVAILABLE";

    // Database/System
    pub const DATABASE_ERROR: &str = "DATABASE_ERROR";
    pub const INTERNAL_SERVER_ERROR: &str = "INTERNAL_SERVER_ERROR";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
}

pub mod error_types {
    pub const VALIDATION_ERROR: &str = "validation_error";
    pub const AUTHENTICATION_ERROR: &str = "authentication_error";
    pub const AUTHORIZATION_ERROR: &str = "authorization_error";
    pub const CONFLICT_ERROR: &str = "conflict_error";
    pub const SERVER_ERROR: &str = "server_error";
    pub const SERVICE_UNAVAILABLE_ERROR: &str = "service_unavailable_error";
}
