//! # Communication Error Types

use crate::messaging::MessagingError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommunicationError {
    #[error("Middleware {middleware} rejected message: {reason}")]
    MiddlewareRejected { middleware: String, reason: String },

    #[error("Circuit breaker is open for recipient {recipient}")]
    CircuitOpen { recipient: String },

    #[error("Request to {recipient} timed out after {timeout_ms}ms")]
    Timeout { recipient: String, timeout_ms: u64 },

    #[error("Message to {recipient} was dead-lettered: {reason}")]
    DeadLettered { recipient: String, reason: String },

    #[error("Recipient {recipient} failed to process request: {message}")]
    RemoteFailure { recipient: String, message: String },

    #[error("Response from {recipient} is missing required fields: {missing:?}")]
    InvalidResponse {
        recipient: String,
        missing: Vec<String>,
    },

    #[error("Conversation not found: {conversation_id}")]
    ConversationNotFound { conversation_id: Uuid },

    #[error("Response channel closed before an outcome arrived")]
    ChannelClosed,

    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

impl CommunicationError {
    pub fn middleware_rejected(middleware: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MiddlewareRejected {
            middleware: middleware.into(),
            reason: reason.into(),
        }
    }

    pub fn circuit_open(recipient: impl Into<String>) -> Self {
        Self::CircuitOpen {
            recipient: recipient.into(),
        }
    }

    /// Whether the failure says something about the recipient's health
    pub fn is_recipient_failure(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::DeadLettered { .. }
                | Self::RemoteFailure { .. }
                | Self::InvalidResponse { .. }
        )
    }
}

pub type CommunicationResult<T> = Result<T, CommunicationError>;
