//! # Message Structures
//!
//! Wire records exchanged between the orchestrator and role handlers, plus the
//! delivery metadata ([`Envelope`]) the delivery service tracks for each message.

use crate::roles::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Delivery urgency for unordered traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl MessagePriority {
    /// Highest priority first
    pub const DESCENDING: [MessagePriority; 4] = [
        MessagePriority::Critical,
        MessagePriority::High,
        MessagePriority::Normal,
        MessagePriority::Low,
    ];

    pub(crate) fn bucket_index(self) -> usize {
        match self {
            MessagePriority::Critical => 0,
            MessagePriority::High => 1,
            MessagePriority::Normal => 2,
            MessagePriority::Low => 3,
        }
    }
}

/// Message type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    StepRequest,
    StepResponse,
    Compensation,
    ConversationStart,
    Notification,
    Broadcast,
}

/// Request for a role handler to execute one workflow step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRequest {
    pub workflow_id: Uuid,
    pub step_id: Uuid,
    pub step_name: String,
    pub role: Role,
    /// Step-specific input built by the plan
    pub input: serde_json::Value,
    /// Outputs of earlier steps keyed by step name
    pub context: BTreeMap<String, serde_json::Value>,
}

/// Request for a role handler to undo a committed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationRequest {
    pub action_id: Uuid,
    pub workflow_id: Uuid,
    pub role: Role,
    pub action_type: String,
    pub payload: serde_json::Value,
}

/// Typed message body; `Opaque` is reserved for payloads owned by pluggable business logic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MessagePayload {
    StepRequest(StepRequest),
    Compensation(CompensationRequest),
    Opaque(serde_json::Value),
}

impl MessagePayload {
    /// Serialized size in bytes, used by payload limits
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

/// A single message addressed to one recipient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender: String,
    pub recipient: String,
    pub kind: MessageKind,
    pub payload: MessagePayload,
    pub requires_ack: bool,
    pub correlation_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        kind: MessageKind,
        payload: MessagePayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            recipient: recipient.into(),
            kind,
            payload,
            requires_ack: false,
            correlation_id: None,
            conversation_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_ack(mut self, requires_ack: bool) -> Self {
        self.requires_ack = requires_ack;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_conversation_id(mut self, conversation_id: Uuid) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }
}

/// Delivery lifecycle of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Acknowledged,
    Failed,
    DeadLetter,
}

/// Result of one transport attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Sent,
    TransportFailed,
    AckTimeout,
    Acknowledged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub attempt: u32,
    pub attempted_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
}

/// An outbound message plus the metadata needed to deliver it reliably
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message: Message,
    pub priority: MessagePriority,
    pub ordered_group: Option<String>,
    /// Position within the ordered group, assigned at enqueue
    pub sequence_number: Option<u64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: DeliveryStatus,
    pub attempts: Vec<DeliveryAttempt>,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest instant the envelope may be dequeued again (retry backoff)
    #[serde(skip)]
    pub not_before: Option<Instant>,
}

impl Envelope {
    pub fn new(
        message: Message,
        priority: MessagePriority,
        ordered_group: Option<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            message,
            priority,
            ordered_group,
            sequence_number: None,
            retry_count: 0,
            max_retries,
            status: DeliveryStatus::Pending,
            attempts: Vec::new(),
            enqueued_at: Utc::now(),
            not_before: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.message.id
    }

    pub fn recipient(&self) -> &str {
        &self.message.recipient
    }

    /// Whether the retry budget allows another attempt
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |at| now >= at)
    }

    pub fn record_attempt(&mut self, outcome: AttemptOutcome, error: Option<String>) {
        self.attempts.push(DeliveryAttempt {
            attempt: self.retry_count + 1,
            attempted_at: Utc::now(),
            outcome,
            error,
        });
    }

    /// Reset for another attempt after `delay`
    pub fn schedule_retry(&mut self, delay: Duration) {
        self.retry_count += 1;
        self.status = DeliveryStatus::Pending;
        self.not_before = Some(Instant::now() + delay);
    }
}

/// Recipient verdict carried by an acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// Message processed; `response` carries the handler output
    Success,
    /// Message received but the handler failed; `error` explains why
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgment {
    pub message_id: Uuid,
    pub status: AckStatus,
    pub response: Option<serde_json::Value>,
    pub error: Option<String>,
    pub processing_time_ms: u64,
    pub acknowledged_at: DateTime<Utc>,
}

impl Acknowledgment {
    pub fn success(
        message_id: Uuid,
        response: Option<serde_json::Value>,
        processing_time: Duration,
    ) -> Self {
        Self {
            message_id,
            status: AckStatus::Success,
            response,
            error: None,
            processing_time_ms: processing_time.as_millis() as u64,
            acknowledged_at: Utc::now(),
        }
    }

    pub fn failure(message_id: Uuid, error: impl Into<String>, processing_time: Duration) -> Self {
        Self {
            message_id,
            status: AckStatus::Failure,
            response: None,
            error: Some(error.into()),
            processing_time_ms: processing_time.as_millis() as u64,
            acknowledged_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == AckStatus::Success
    }
}

/// Final delivery result reported to a send callback, exactly once per message
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Transport accepted a message that did not require acknowledgment
    Delivered,
    Acknowledged(Acknowledgment),
    DeadLettered { reason: String },
}
