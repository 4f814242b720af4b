//! # Middleware Pipeline
//!
//! Ordered transforms around a communication manager. Outgoing messages pass
//! through middlewares in registration order, incoming messages in reverse order.
//! Any middleware may reject a message by returning an error reason.

use crate::messaging::Message;
use std::fmt::Debug;
use tracing::debug;

/// Result of a middleware stage: the (possibly transformed) message or a rejection reason
pub type MiddlewareResult = Result<Message, String>;

pub trait Middleware: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn outgoing(&self, message: Message) -> MiddlewareResult {
        Ok(message)
    }

    fn incoming(&self, message: Message) -> MiddlewareResult {
        Ok(message)
    }
}

/// Traces every message in both directions
#[derive(Debug, Default)]
pub struct MessageLoggingMiddleware;

impl Middleware for MessageLoggingMiddleware {
    fn name(&self) -> &str {
        "message_logging"
    }

    fn outgoing(&self, message: Message) -> MiddlewareResult {
        debug!(
            message_id = %message.id,
            sender = %message.sender,
            recipient = %message.recipient,
            kind = ?message.kind,
            "➡️ Outgoing message"
        );
        Ok(message)
    }

    fn incoming(&self, message: Message) -> MiddlewareResult {
        debug!(
            message_id = %message.id,
            sender = %message.sender,
            recipient = %message.recipient,
            kind = ?message.kind,
            "⬅️ Incoming message"
        );
        Ok(message)
    }
}

/// Rejects messages whose serialized payload exceeds a byte limit
#[derive(Debug)]
pub struct PayloadSizeLimitMiddleware {
    max_bytes: usize,
}

impl PayloadSizeLimitMiddleware {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    fn check(&self, message: Message) -> MiddlewareResult {
        let size = message.payload.size_bytes();
        if size > self.max_bytes {
            return Err(format!(
                "payload of {size} bytes exceeds limit of {} bytes",
                self.max_bytes
            ));
        }
        Ok(message)
    }
}

impl Middleware for PayloadSizeLimitMiddleware {
    fn name(&self) -> &str {
        "payload_size_limit"
    }

    fn outgoing(&self, message: Message) -> MiddlewareResult {
        self.check(message)
    }

    fn incoming(&self, message: Message) -> MiddlewareResult {
        self.check(message)
    }
}
