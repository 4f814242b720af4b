//! # Communication Layer
//!
//! Owner-scoped messaging on top of the delivery service: middleware, circuit
//! breaking per recipient, request/response with deadlines, broadcast and
//! conversations.

pub mod conversation;
pub mod errors;
pub mod manager;
pub mod middleware;

pub use conversation::{Conversation, ConversationRegistry};
pub use errors::{CommunicationError, CommunicationResult};
pub use manager::{
    CommunicationCounters, CommunicationManager, CommunicationStatistics, RequestOptions,
    SendOptions,
};
pub use middleware::{
    MessageLoggingMiddleware, Middleware, MiddlewareResult, PayloadSizeLimitMiddleware,
};
