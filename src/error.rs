use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

/// Engine error taxonomy.
///
/// Every gateway handler returns this type; the dispatch loop is the single
/// place where a variant is turned into an `error` event for the offending
/// connection. Nothing here ever reaches other subscribers.
#[derive(Error, Debug)]
pub enum ChatError {
    // ===== Authentication & Authorization =====
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Authorization error: {0}")]
    Authorization(String),

    // ===== Rate Limiting =====
    #[error("Rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: i64 },

    // ===== Validation =====
    #[error("Validation error: {0}")]
    Validation(String),

    // ===== Pipeline Stages =====
    #[error("Stage timed out: {0}")]
    Timeout(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Indexing error: {0}")]
    Indexing(String),

    // ===== Storage =====
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    // ===== Serialization =====
    #[error("Serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ===== Transport =====
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    // ===== Internal =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// Wire-level code carried by the `error` event
    pub fn wire_code(&self) -> &'static str {
        match self {
            ChatError::Auth(_) | ChatError::Jwt(_) => "auth_failed",
            ChatError::Authorization(_) => "not_authorized",
            ChatError::RateLimited { .. } => "rate_limit_exceeded",
            ChatError::Validation(_) | ChatError::Json(_) => "validation_failed",
            _ => "message_error",
        }
    }

    /// Retry hint for rate-limited requests
    pub fn retry_after_secs(&self) -> Option<i64> {
        match self {
            ChatError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Get a user-friendly error message (without sensitive details)
    pub fn user_message(&self) -> String {
        match self {
            ChatError::Auth(msg) => format!("Authentication failed: {}", msg),
            ChatError::Jwt(_) => "Invalid or expired token".to_string(),
            ChatError::Authorization(msg) => format!("Not authorized: {}", msg),
            ChatError::RateLimited { retry_after_secs } => {
                format!("Rate limit exceeded. Try again in {} seconds", retry_after_secs)
            }
            ChatError::Validation(msg) => format!("Validation error: {}", msg),
            ChatError::Json(_) => "Malformed event payload".to_string(),
            _ => "Message could not be processed".to_string(),
        }
    }

    /// Faults of our own infrastructure, as opposed to bad client input
    fn is_server_fault(&self) -> bool {
        matches!(
            self,
            ChatError::Timeout(_)
                | ChatError::Encryption(_)
                | ChatError::Decryption(_)
                | ChatError::Indexing(_)
                | ChatError::Database(_)
                | ChatError::Redis(_)
                | ChatError::Serialization(_)
                | ChatError::Deserialization(_)
                | ChatError::Internal(_)
        )
    }

    /// Log this error with appropriate level and context
    pub fn log(&self) {
        let code = self.wire_code();

        if self.is_server_fault() {
            tracing::error!(error = %self, error_code = %code, "Server error occurred");
        } else if matches!(self, ChatError::Auth(_) | ChatError::Jwt(_)) {
            tracing::warn!(error = %self, error_code = %code, "Authentication failed");
        } else {
            tracing::debug!(error = %self, error_code = %code, "Client error occurred");
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::WebSocket(err.to_string())
    }
}

// ============================================================================
// Helper functions for creating common errors
// ============================================================================

impl ChatError {
    pub fn auth(msg: impl Into<String>) -> Self {
        ChatError::Auth(msg.into())
    }

    pub fn authorization(msg: impl Into<String>) -> Self {
        ChatError::Authorization(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ChatError::Validation(msg.into())
    }

    pub fn encryption(msg: impl Into<String>) -> Self {
        ChatError::Encryption(msg.into())
    }

    pub fn decryption(msg: impl Into<String>) -> Self {
        ChatError::Decryption(msg.into())
    }

    pub fn indexing(msg: impl Into<String>) -> Self {
        ChatError::Indexing(msg.into())
    }

    pub fn timeout(stage: impl Into<String>) -> Self {
        ChatError::Timeout(stage.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ChatError::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_follow_the_taxonomy() {
        assert_eq!(ChatError::auth("bad token").wire_code(), "auth_failed");
        assert_eq!(
            ChatError::authorization("not a member").wire_code(),
            "not_authorized"
        );
        assert_eq!(
            ChatError::RateLimited { retry_after_secs: 12 }.wire_code(),
            "rate_limit_exceeded"
        );
        assert_eq!(
            ChatError::validation("empty content").wire_code(),
            "validation_failed"
        );
        assert_eq!(ChatError::timeout("persistence").wire_code(), "message_error");
        assert_eq!(ChatError::encryption("nonce").wire_code(), "message_error");
    }

    #[test]
    fn retry_after_only_on_rate_limits() {
        assert_eq!(
            ChatError::RateLimited { retry_after_secs: 7 }.retry_after_secs(),
            Some(7)
        );
        assert_eq!(ChatError::validation("x").retry_after_secs(), None);
    }

    #[test]
    fn user_messages_hide_internals() {
        let err = ChatError::Internal("pool exhausted at 10.0.0.3".to_string());
        assert_eq!(err.user_message(), "Message could not be processed");
    }
}
