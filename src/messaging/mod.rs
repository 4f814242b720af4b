//! # Messaging Substrate
//!
//! In-memory reliable messaging between the orchestrator and role handlers.
//!
//! ## Components
//!
//! - [`MessageQueue`]: priority buckets plus strictly ordered groups
//! - [`DeadLetterQueue`]: bounded store of messages that exhausted their retries
//! - [`MessageDeliveryService`]: delivery loop, acknowledgments, retries, dead lettering
//! - [`Transport`]: the one-shot delivery seam implemented by callers

pub mod dead_letter;
pub mod delivery;
pub mod errors;
pub mod message;
pub mod queue;
pub mod transport;

pub use dead_letter::{DeadLetterEntry, DeadLetterQueue, DeadLetterStatistics};
pub use delivery::{DeliveryCallback, DeliveryStatistics, MessageDeliveryService};
pub use errors::{MessagingError, MessagingResult};
pub use message::{
    AckStatus, Acknowledgment, AttemptOutcome, CompensationRequest, DeliveryAttempt,
    DeliveryOutcome, DeliveryStatus, Envelope, Message, MessageKind, MessagePayload,
    MessagePriority, StepRequest,
};
pub use queue::MessageQueue;
pub use transport::{AckSender, Transport};
