//! # Messaging Error Types
//!
//! Structured errors for the queue, dead letter queue, transport and delivery service.

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MessagingError {
    #[error("Transport failed for recipient {recipient}: {message}")]
    Transport { recipient: String, message: String },

    #[error("Acknowledgment for message {message_id} timed out after {timeout_ms}ms")]
    AckTimeout { message_id: Uuid, timeout_ms: u64 },

    #[error("Message not found in dead letter queue: {message_id}")]
    DeadLetterNotFound { message_id: Uuid },

    #[error("Delivery service is not running")]
    ServiceStopped,

    #[error("Message serialization error: {message}")]
    Serialization { message: String },

    #[error("Internal messaging error: {message}")]
    Internal { message: String },
}

impl MessagingError {
    /// Create a transport failure error
    pub fn transport(recipient: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            recipient: recipient.into(),
            message: message.into(),
        }
    }

    pub fn ack_timeout(message_id: Uuid, timeout_ms: u64) -> Self {
        Self::AckTimeout {
            message_id,
            timeout_ms,
        }
    }

    pub fn dead_letter_not_found(message_id: Uuid) -> Self {
        Self::DeadLetterNotFound { message_id }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether another delivery attempt may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::AckTimeout { .. })
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

pub type MessagingResult<T> = Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(MessagingError::transport("a", "refused").is_transient());
        assert!(MessagingError::ack_timeout(Uuid::new_v4(), 10).is_transient());
        assert!(!MessagingError::ServiceStopped.is_transient());
        assert!(!MessagingError::dead_letter_not_found(Uuid::new_v4()).is_transient());
    }

    #[test]
    fn test_display_includes_context() {
        let err = MessagingError::transport("consent_check_agent", "connection reset");
        let text = err.to_string();
        assert!(text.contains("consent_check_agent"));
        assert!(text.contains("connection reset"));
    }
}
