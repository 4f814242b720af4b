//! # Communication Manager
//!
//! Per-owner façade over the [`MessageDeliveryService`]. Adds the middleware
//! pipeline, per-recipient circuit breaking, request/response correlation,
//! broadcast and conversation tracking.
//!
//! Breaker accounting happens here and only here: every message a manager sends
//! reports its final outcome to the recipient's breaker exactly once.

use super::conversation::{Conversation, ConversationRegistry};
use super::errors::{CommunicationError, CommunicationResult};
use super::middleware::{Middleware, PayloadSizeLimitMiddleware};
use crate::config::CommunicationConfig;
use crate::messaging::{
    DeliveryCallback, DeliveryOutcome, DeliveryStatistics, Message, MessageDeliveryService,
    MessageKind, MessagePayload, MessagePriority,
};
use crate::resilience::{CircuitBreakerManager, SystemCircuitBreakerMetrics};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Options for fire-and-forget sends
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub priority: MessagePriority,
    pub ordered_group: Option<String>,
    pub requires_ack: bool,
    /// Delivery retries; the delivery service default when absent
    pub max_retries: Option<u32>,
}

/// Options for [`CommunicationManager::send_request_response`]
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Deadline for the response; the configured default when absent
    pub timeout: Option<Duration>,
    pub priority: MessagePriority,
    pub max_retries: Option<u32>,
    /// Fields the response payload must carry to count as a success
    pub required_fields: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CommunicationCounters {
    pub messages_sent: u64,
    pub broadcasts: u64,
    pub requests: u64,
    pub responses: u64,
    pub request_timeouts: u64,
    pub middleware_rejections: u64,
    pub circuit_rejections: u64,
    pub remote_failures: u64,
    pub invalid_responses: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    recipient: String,
    message_id: Uuid,
    started_at: DateTime<Utc>,
}

/// Drops the correlation entry even when the awaiting future is cancelled
struct PendingRequestGuard<'a> {
    requests: &'a DashMap<Uuid, PendingRequest>,
    correlation_id: Uuid,
}

impl Drop for PendingRequestGuard<'_> {
    fn drop(&mut self) {
        self.requests.remove(&self.correlation_id);
    }
}

/// Merged statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CommunicationStatistics {
    pub owner_id: String,
    pub counters: CommunicationCounters,
    pub pending_requests: usize,
    pub oldest_pending_request_at: Option<DateTime<Utc>>,
    pub middleware: Vec<String>,
    pub delivery: DeliveryStatistics,
    pub circuit_breakers: SystemCircuitBreakerMetrics,
    pub conversations: Vec<Conversation>,
}

#[derive(Debug)]
pub struct CommunicationManager {
    owner_id: String,
    delivery: Arc<MessageDeliveryService>,
    breakers: Arc<CircuitBreakerManager>,
    config: CommunicationConfig,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    pending_requests: DashMap<Uuid, PendingRequest>,
    conversations: ConversationRegistry,
    counters: Arc<Mutex<CommunicationCounters>>,
}

impl CommunicationManager {
    /// Create a manager; payload size limiting is always installed first
    pub fn new(
        owner_id: impl Into<String>,
        delivery: Arc<MessageDeliveryService>,
        breakers: Arc<CircuitBreakerManager>,
        config: CommunicationConfig,
    ) -> Self {
        let owner_id = owner_id.into();
        let size_limit: Arc<dyn Middleware> =
            Arc::new(PayloadSizeLimitMiddleware::new(config.max_payload_bytes));
        info!(owner_id = %owner_id, "📡 Communication manager initialized");

        Self {
            owner_id,
            delivery,
            breakers,
            config,
            middleware: RwLock::new(vec![size_limit]),
            pending_requests: DashMap::new(),
            conversations: ConversationRegistry::default(),
            counters: Arc::new(Mutex::new(CommunicationCounters::default())),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    pub fn delivery(&self) -> &Arc<MessageDeliveryService> {
        &self.delivery
    }

    /// Append a middleware to the end of the outgoing pipeline
    pub fn add_middleware(&self, middleware: Arc<dyn Middleware>) {
        debug!(owner_id = %self.owner_id, middleware = middleware.name(), "Middleware added");
        self.middleware.write().push(middleware);
    }

    /// Fire-and-forget send; the delivery outcome feeds the recipient's breaker
    pub fn send_message(
        &self,
        recipient: &str,
        kind: MessageKind,
        payload: MessagePayload,
        options: SendOptions,
    ) -> CommunicationResult<Uuid> {
        let message = Message::new(self.owner_id.clone(), recipient, kind, payload)
            .with_ack(options.requires_ack);
        self.dispatch(message, options)
    }

    /// Send one message to every recipient, continuing past individual failures.
    ///
    /// Returns the ids of the messages actually queued.
    pub fn broadcast_message(
        &self,
        recipients: &[String],
        kind: MessageKind,
        payload: MessagePayload,
        options: SendOptions,
    ) -> Vec<Uuid> {
        self.counters.lock().broadcasts += 1;

        let queued: Vec<Uuid> = recipients
            .iter()
            .filter_map(|recipient| {
                match self.send_message(recipient, kind, payload.clone(), options.clone()) {
                    Ok(id) => Some(id),
                    Err(err) => {
                        warn!(
                            owner_id = %self.owner_id,
                            recipient = %recipient,
                            error = %err,
                            "Broadcast recipient skipped"
                        );
                        None
                    }
                }
            })
            .collect();

        info!(
            owner_id = %self.owner_id,
            recipients = recipients.len(),
            queued = queued.len(),
            "📢 Broadcast sent"
        );
        queued
    }

    /// Send a request and await the recipient's response payload.
    ///
    /// Fails fast when the recipient's breaker is open. A response that arrives
    /// after `timeout` is discarded.
    #[instrument(skip(self, payload, options), fields(owner_id = %self.owner_id))]
    pub async fn send_request_response(
        &self,
        recipient: &str,
        kind: MessageKind,
        payload: MessagePayload,
        options: RequestOptions,
    ) -> CommunicationResult<serde_json::Value> {
        let correlation_id = Uuid::new_v4();
        let message = Message::new(self.owner_id.clone(), recipient, kind, payload)
            .with_ack(true)
            .with_correlation_id(correlation_id);
        let message = self.apply_outgoing(message)?;
        self.acquire(recipient)?;

        let (tx, rx) = oneshot::channel();
        let callback: DeliveryCallback = Box::new(move |outcome| {
            let _ = tx.send(outcome);
        });

        let message_id = message.id;
        let max_retries = options
            .max_retries
            .unwrap_or(self.delivery.config().default_max_retries);
        self.delivery
            .send_message(message, options.priority, None, max_retries, Some(callback))?;

        self.pending_requests.insert(
            correlation_id,
            PendingRequest {
                recipient: recipient.to_string(),
                message_id,
                started_at: Utc::now(),
            },
        );
        let pending = PendingRequestGuard {
            requests: &self.pending_requests,
            correlation_id,
        };
        {
            let mut counters = self.counters.lock();
            counters.requests += 1;
            counters.messages_sent += 1;
        }

        let deadline = options
            .timeout
            .unwrap_or_else(|| self.config.default_request_timeout());
        let outcome = tokio::time::timeout(deadline, rx).await;
        drop(pending);

        let result = match outcome {
            Err(_) => {
                self.counters.lock().request_timeouts += 1;
                Err(CommunicationError::Timeout {
                    recipient: recipient.to_string(),
                    timeout_ms: deadline.as_millis() as u64,
                })
            }
            Ok(Err(_)) => Err(CommunicationError::ChannelClosed),
            Ok(Ok(outcome)) => self.interpret_response(recipient, outcome, &options.required_fields),
        };

        match &result {
            Ok(_) => {
                self.breakers.record_success(recipient);
                self.counters.lock().responses += 1;
            }
            Err(err) if err.is_recipient_failure() => self.breakers.record_failure(recipient),
            Err(_) => {}
        }

        debug!(
            %message_id,
            %correlation_id,
            recipient = %recipient,
            success = result.is_ok(),
            "Request settled"
        );
        result
    }

    /// Open a conversation and send the opening message to every participant
    pub fn start_conversation(
        &self,
        participants: Vec<String>,
        conversation_type: &str,
        opening: serde_json::Value,
    ) -> CommunicationResult<Uuid> {
        let conversation =
            self.conversations
                .open(conversation_type, self.owner_id.clone(), participants);

        let mut sent = 0;
        for participant in &conversation.participants {
            let message = Message::new(
                self.owner_id.clone(),
                participant.clone(),
                MessageKind::ConversationStart,
                MessagePayload::Opaque(opening.clone()),
            )
            .with_conversation_id(conversation.id);
            let options = SendOptions {
                ordered_group: Some(conversation.ordered_group(participant)),
                ..Default::default()
            };
            match self.dispatch(message, options) {
                Ok(_) => sent += 1,
                Err(err) => warn!(
                    conversation_id = %conversation.id,
                    participant = %participant,
                    error = %err,
                    "Conversation participant not reached"
                ),
            }
        }
        self.conversations.record_messages(conversation.id, sent);

        info!(
            conversation_id = %conversation.id,
            conversation_type = %conversation_type,
            participants = conversation.participants.len(),
            "💬 Conversation started"
        );
        Ok(conversation.id)
    }

    /// Send a follow-up message within an existing conversation
    pub fn send_in_conversation(
        &self,
        conversation_id: Uuid,
        recipient: &str,
        payload: serde_json::Value,
    ) -> CommunicationResult<Uuid> {
        let conversation = self
            .conversations
            .get(conversation_id)
            .ok_or(CommunicationError::ConversationNotFound { conversation_id })?;

        let message = Message::new(
            self.owner_id.clone(),
            recipient,
            MessageKind::Notification,
            MessagePayload::Opaque(payload),
        )
        .with_conversation_id(conversation_id);
        let options = SendOptions {
            ordered_group: Some(conversation.ordered_group(recipient)),
            ..Default::default()
        };
        let id = self.dispatch(message, options)?;
        self.conversations.record_messages(conversation_id, 1);
        Ok(id)
    }

    pub fn conversation(&self, conversation_id: Uuid) -> Option<Conversation> {
        self.conversations.get(conversation_id)
    }

    /// Run a received message through the incoming pipeline (reverse order)
    pub fn process_incoming(&self, message: Message) -> CommunicationResult<Message> {
        let pipeline = self.middleware.read().clone();
        pipeline.iter().rev().try_fold(message, |message, middleware| {
            middleware.incoming(message).map_err(|reason| {
                self.counters.lock().middleware_rejections += 1;
                CommunicationError::middleware_rejected(middleware.name(), reason)
            })
        })
    }

    pub fn get_communication_statistics(&self) -> CommunicationStatistics {
        let oldest_pending_request_at = self
            .pending_requests
            .iter()
            .map(|entry| entry.started_at)
            .min();

        CommunicationStatistics {
            owner_id: self.owner_id.clone(),
            counters: self.counters.lock().clone(),
            pending_requests: self.pending_requests.len(),
            oldest_pending_request_at,
            middleware: self
                .middleware
                .read()
                .iter()
                .map(|m| m.name().to_string())
                .collect(),
            delivery: self.delivery.get_statistics(),
            circuit_breakers: self.breakers.snapshot(),
            conversations: self.conversations.list(),
        }
    }

    /// Recipients with an outstanding request, for diagnostics
    pub fn pending_request_recipients(&self) -> Vec<(String, Uuid)> {
        self.pending_requests
            .iter()
            .map(|entry| (entry.recipient.clone(), entry.message_id))
            .collect()
    }

    fn dispatch(&self, message: Message, options: SendOptions) -> CommunicationResult<Uuid> {
        let message = self.apply_outgoing(message)?;
        let recipient = message.recipient.clone();
        self.acquire(&recipient)?;

        let breakers = Arc::clone(&self.breakers);
        let counters = Arc::clone(&self.counters);
        let callback: DeliveryCallback = Box::new(move |outcome| match outcome {
            DeliveryOutcome::Delivered => breakers.record_success(&recipient),
            DeliveryOutcome::Acknowledged(ack) if ack.is_success() => {
                breakers.record_success(&recipient)
            }
            DeliveryOutcome::Acknowledged(_) => {
                counters.lock().remote_failures += 1;
                breakers.record_failure(&recipient);
            }
            DeliveryOutcome::DeadLettered { .. } => {
                counters.lock().dead_lettered += 1;
                breakers.record_failure(&recipient);
            }
        });

        let max_retries = options
            .max_retries
            .unwrap_or(self.delivery.config().default_max_retries);
        let id = self.delivery.send_message(
            message,
            options.priority,
            options.ordered_group,
            max_retries,
            Some(callback),
        )?;
        self.counters.lock().messages_sent += 1;
        Ok(id)
    }

    fn apply_outgoing(&self, message: Message) -> CommunicationResult<Message> {
        let pipeline = self.middleware.read().clone();
        pipeline.iter().try_fold(message, |message, middleware| {
            middleware.outgoing(message).map_err(|reason| {
                self.counters.lock().middleware_rejections += 1;
                warn!(
                    owner_id = %self.owner_id,
                    middleware = middleware.name(),
                    reason = %reason,
                    "Outgoing message rejected"
                );
                CommunicationError::middleware_rejected(middleware.name(), reason)
            })
        })
    }

    fn acquire(&self, recipient: &str) -> CommunicationResult<()> {
        self.breakers.try_acquire(recipient).map_err(|_| {
            self.counters.lock().circuit_rejections += 1;
            CommunicationError::circuit_open(recipient)
        })
    }

    fn interpret_response(
        &self,
        recipient: &str,
        outcome: DeliveryOutcome,
        required_fields: &[String],
    ) -> CommunicationResult<serde_json::Value> {
        let response = match outcome {
            DeliveryOutcome::Acknowledged(ack) if ack.is_success() => {
                ack.response.unwrap_or(serde_json::Value::Null)
            }
            DeliveryOutcome::Acknowledged(ack) => {
                self.counters.lock().remote_failures += 1;
                return Err(CommunicationError::RemoteFailure {
                    recipient: recipient.to_string(),
                    message: ack.error.unwrap_or_else(|| "unspecified failure".to_string()),
                });
            }
            DeliveryOutcome::DeadLettered { reason } => {
                self.counters.lock().dead_lettered += 1;
                return Err(CommunicationError::DeadLettered {
                    recipient: recipient.to_string(),
                    reason,
                });
            }
            DeliveryOutcome::Delivered => serde_json::Value::Null,
        };

        let missing: Vec<String> = required_fields
            .iter()
            .filter(|field| response.get(field.as_str()).map_or(true, serde_json::Value::is_null))
            .cloned()
            .collect();
        if !missing.is_empty() {
            self.counters.lock().invalid_responses += 1;
            return Err(CommunicationError::InvalidResponse {
                recipient: recipient.to_string(),
                missing,
            });
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerSettings, DeliveryConfig};
    use crate::messaging::{
        AckSender, Acknowledgment, MessagingError, MessagingResult, Transport,
    };
    use async_trait::async_trait;
    use serde_json::json;

    /// Behaviour keyed by recipient name
    #[derive(Debug, Default)]
    struct RecipientTransport {
        seen: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl Transport for RecipientTransport {
        async fn send(&self, message: &Message, acks: &AckSender) -> MessagingResult<()> {
            self.seen.lock().push(message.clone());
            match message.recipient.as_str() {
                "broken" => Err(MessagingError::transport("broken", "unreachable")),
                "silent" => Ok(()),
                "failing" => {
                    acks.acknowledge(Acknowledgment::failure(
                        message.id,
                        "handler exploded",
                        Duration::ZERO,
                    ));
                    Ok(())
                }
                _ => {
                    if message.requires_ack {
                        acks.acknowledge(Acknowledgment::success(
                            message.id,
                            Some(json!({"echo": message.recipient, "score": 1})),
                            Duration::ZERO,
                        ));
                    }
                    Ok(())
                }
            }
        }
    }

    fn manager_with(threshold: u32) -> (CommunicationManager, Arc<RecipientTransport>) {
        let transport = Arc::new(RecipientTransport::default());
        let delivery = Arc::new(MessageDeliveryService::new(
            DeliveryConfig {
                poll_interval_ms: 5,
                ack_timeout_ms: 500,
                base_delay_ms: 1,
                max_delay_ms: 2,
                default_max_retries: 0,
                jitter_enabled: false,
                ..Default::default()
            },
            transport.clone(),
        ));
        delivery.start();
        let breakers = Arc::new(CircuitBreakerManager::new(CircuitBreakerSettings {
            failure_threshold: threshold,
            ..Default::default()
        }));
        let manager = CommunicationManager::new(
            "orchestrator",
            delivery,
            breakers,
            CommunicationConfig {
                default_request_timeout_ms: 1000,
                max_payload_bytes: 1024,
            },
        );
        (manager, transport)
    }

    fn payload(value: serde_json::Value) -> MessagePayload {
        MessagePayload::Opaque(value)
    }

    #[tokio::test]
    async fn test_request_response_returns_payload() {
        let (manager, _) = manager_with(5);
        let response = manager
            .send_request_response(
                "echo",
                MessageKind::Notification,
                payload(json!({"q": 1})),
                RequestOptions {
                    required_fields: vec!["echo".to_string()],
                    ..Default::default()
                },
            )
            .await
            .expect("response");

        assert_eq!(response["echo"], "echo");
        let stats = manager.get_communication_statistics();
        assert_eq!(stats.counters.requests, 1);
        assert_eq!(stats.counters.responses, 1);
        assert_eq!(stats.pending_requests, 0);
    }

    #[tokio::test]
    async fn test_missing_required_fields_is_invalid_response() {
        let (manager, _) = manager_with(5);
        let err = manager
            .send_request_response(
                "echo",
                MessageKind::Notification,
                payload(json!({})),
                RequestOptions {
                    required_fields: vec!["echo".into(), "verdict".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();

        assert_eq!(
            err,
            CommunicationError::InvalidResponse {
                recipient: "echo".into(),
                missing: vec!["verdict".into()],
            }
        );
    }

    #[tokio::test]
    async fn test_request_timeout_counts_against_breaker() {
        let (manager, _) = manager_with(1);
        let err = manager
            .send_request_response(
                "silent",
                MessageKind::Notification,
                payload(json!({})),
                RequestOptions {
                    timeout: Some(Duration::from_millis(50)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CommunicationError::Timeout { .. }));

        let rejected = manager
            .send_request_response(
                "silent",
                MessageKind::Notification,
                payload(json!({})),
                RequestOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(rejected, CommunicationError::circuit_open("silent"));

        let counters = manager.get_communication_statistics().counters;
        assert_eq!(counters.request_timeouts, 1);
        assert_eq!(counters.circuit_rejections, 1);
    }

    #[tokio::test]
    async fn test_remote_failure_is_reported() {
        let (manager, _) = manager_with(5);
        let err = manager
            .send_request_response(
                "failing",
                MessageKind::Notification,
                payload(json!({})),
                RequestOptions::default(),
            )
            .await
            .unwrap_err();

        match err {
            CommunicationError::RemoteFailure { recipient, message } => {
                assert_eq!(recipient, "failing");
                assert!(message.contains("exploded"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dead_lettered_request_reports_reason() {
        let (manager, _) = manager_with(5);
        let err = manager
            .send_request_response(
                "broken",
                MessageKind::Notification,
                payload(json!({})),
                RequestOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CommunicationError::DeadLettered { .. }));
        assert_eq!(manager.delivery().dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected_by_middleware() {
        let (manager, transport) = manager_with(5);
        let big = "x".repeat(4096);
        let err = manager
            .send_message(
                "echo",
                MessageKind::Notification,
                payload(json!({ "blob": big })),
                SendOptions::default(),
            )
            .unwrap_err();

        assert!(matches!(err, CommunicationError::MiddlewareRejected { .. }));
        assert!(transport.seen.lock().is_empty());
        assert_eq!(
            manager.get_communication_statistics().counters.middleware_rejections,
            1
        );
    }

    #[tokio::test]
    async fn test_broadcast_skips_rejected_recipients() {
        let (manager, _) = manager_with(1);
        manager.breakers().record_failure("down");

        let recipients = vec!["a".to_string(), "down".to_string(), "b".to_string()];
        let queued = manager.broadcast_message(
            &recipients,
            MessageKind::Broadcast,
            payload(json!({"notice": true})),
            SendOptions::default(),
        );

        assert_eq!(queued.len(), 2);
        let counters = manager.get_communication_statistics().counters;
        assert_eq!(counters.broadcasts, 1);
        assert_eq!(counters.circuit_rejections, 1);
    }

    #[tokio::test]
    async fn test_conversation_tags_messages() {
        let (manager, transport) = manager_with(5);
        let conversation_id = manager
            .start_conversation(
                vec!["a".into(), "b".into()],
                "ethics_consult",
                json!({"topic": "consent"}),
            )
            .expect("conversation");
        manager
            .send_in_conversation(conversation_id, "a", json!({"followup": 1}))
            .expect("follow-up");

        let conversation = manager.conversation(conversation_id).expect("recorded");
        assert_eq!(conversation.message_count, 3);

        tokio::time::timeout(Duration::from_secs(2), async {
            while transport.seen.lock().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("all conversation messages sent");
        assert!(transport
            .seen
            .lock()
            .iter()
            .all(|m| m.conversation_id == Some(conversation_id)));
    }

    #[tokio::test]
    async fn test_unknown_conversation_rejected() {
        let (manager, _) = manager_with(5);
        let missing = Uuid::new_v4();
        let err = manager
            .send_in_conversation(missing, "a", json!({}))
            .unwrap_err();
        assert_eq!(
            err,
            CommunicationError::ConversationNotFound {
                conversation_id: missing
            }
        );
    }

    #[derive(Debug)]
    struct Stamp(&'static str);

    impl Middleware for Stamp {
        fn name(&self) -> &str {
            self.0
        }

        fn incoming(&self, mut message: Message) -> super::super::middleware::MiddlewareResult {
            if let MessagePayload::Opaque(serde_json::Value::Array(items)) = &mut message.payload {
                items.push(json!(self.0));
            }
            Ok(message)
        }
    }

    #[tokio::test]
    async fn test_incoming_pipeline_runs_in_reverse() {
        let (manager, _) = manager_with(5);
        manager.add_middleware(Arc::new(Stamp("first")));
        manager.add_middleware(Arc::new(Stamp("second")));

        let message = Message::new(
            "a",
            "orchestrator",
            MessageKind::Notification,
            payload(json!([])),
        );
        let processed = manager.process_incoming(message).expect("accepted");
        assert_eq!(
            processed.payload,
            payload(json!(["second", "first"]))
        );
    }
}
