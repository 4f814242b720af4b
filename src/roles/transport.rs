//! In-process transport dispatching messages to registered role handlers.

use super::{Role, RoleHandler, RoleRegistry};
use crate::messaging::{
    AckSender, Acknowledgment, Message, MessagePayload, MessagingError, MessagingResult, Transport,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Delivers step and compensation requests to local [`RoleHandler`]s.
///
/// Each accepted message runs on its own task; the handler result comes back as an
/// acknowledgment. Messages for roles without a handler fail at the transport.
///
/// [`RoleHandler`]: super::RoleHandler
#[derive(Debug, Clone)]
pub struct LocalRoleTransport {
    registry: RoleRegistry,
}

impl LocalRoleTransport {
    pub fn new(registry: RoleRegistry) -> Self {
        Self { registry }
    }

    fn handler_for(&self, role: Role, message: &Message) -> MessagingResult<Arc<dyn RoleHandler>> {
        self.registry.get(role).ok_or_else(|| {
            MessagingError::transport(
                &message.recipient,
                format!("no handler registered for role {role}"),
            )
        })
    }
}

#[async_trait]
impl Transport for LocalRoleTransport {
    async fn send(&self, message: &Message, acks: &AckSender) -> MessagingResult<()> {
        let message_id = message.id;

        match &message.payload {
            MessagePayload::StepRequest(request) => {
                let handler = self.handler_for(request.role, message)?;
                let request = request.clone();
                let acks = acks.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    let ack = match handler.execute(request).await {
                        Ok(output) => {
                            Acknowledgment::success(message_id, Some(output), started.elapsed())
                        }
                        Err(err) => {
                            debug!(%message_id, error = %err, "Role handler failed");
                            Acknowledgment::failure(
                                message_id,
                                format!("{err:#}"),
                                started.elapsed(),
                            )
                        }
                    };
                    acks.acknowledge(ack);
                });
            }
            MessagePayload::Compensation(request) => {
                let handler = self.handler_for(request.role, message)?;
                let request = request.clone();
                let acks = acks.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    let ack = match handler.compensate(&request).await {
                        Ok(()) => Acknowledgment::success(message_id, None, started.elapsed()),
                        Err(err) => {
                            warn!(
                                %message_id,
                                action = %request.action_type,
                                error = %err,
                                "Compensation failed"
                            );
                            Acknowledgment::failure(
                                message_id,
                                format!("{err:#}"),
                                started.elapsed(),
                            )
                        }
                    };
                    acks.acknowledge(ack);
                });
            }
            MessagePayload::Opaque(_) => {
                let unhandled = Role::from_agent_id(&message.recipient)
                    .is_some_and(|role| !self.registry.contains(role));
                if unhandled {
                    return Err(MessagingError::transport(
                        &message.recipient,
                        "recipient has no handler",
                    ));
                }
                if message.requires_ack {
                    acks.acknowledge(Acknowledgment::success(message_id, None, Duration::ZERO));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{MessageKind, StepRequest};
    use serde_json::json;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    struct Echo;

    #[async_trait]
    impl RoleHandler for Echo {
        async fn execute(&self, request: StepRequest) -> anyhow::Result<serde_json::Value> {
            if request.input.get("explode").is_some() {
                anyhow::bail!("handler exploded");
            }
            Ok(json!({"valid": true, "echo": request.input}))
        }
    }

    fn step_message(role: Role, input: serde_json::Value) -> Message {
        Message::new(
            "orchestrator",
            role.agent_id(),
            MessageKind::StepRequest,
            MessagePayload::StepRequest(StepRequest {
                workflow_id: Uuid::new_v4(),
                step_id: Uuid::new_v4(),
                step_name: "validate".into(),
                role,
                input,
                context: BTreeMap::new(),
            }),
        )
        .with_ack(true)
    }

    #[tokio::test]
    async fn test_step_request_is_acknowledged_with_output() {
        let transport = LocalRoleTransport::new(
            RoleRegistry::new().with_handler(Role::Validation, Arc::new(Echo)),
        );
        let (acks, mut receiver) = AckSender::channel();
        let message = step_message(Role::Validation, json!({"query": "q"}));

        transport.send(&message, &acks).await.expect("sent");
        let ack = receiver.recv().await.expect("ack");
        assert!(ack.is_success());
        assert_eq!(ack.message_id, message.id);
        assert_eq!(ack.response.expect("response")["echo"]["query"], "q");
    }

    #[tokio::test]
    async fn test_handler_error_becomes_failure_ack() {
        let transport = LocalRoleTransport::new(
            RoleRegistry::new().with_handler(Role::Validation, Arc::new(Echo)),
        );
        let (acks, mut receiver) = AckSender::channel();
        transport
            .send(&step_message(Role::Validation, json!({"explode": 1})), &acks)
            .await
            .expect("sent");

        let ack = receiver.recv().await.expect("ack");
        assert!(!ack.is_success());
        assert!(ack.error.expect("error").contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_missing_handler_fails_transport() {
        let transport = LocalRoleTransport::new(RoleRegistry::new());
        let (acks, _receiver) = AckSender::channel();
        let result = transport
            .send(&step_message(Role::EthicsReview, json!({})), &acks)
            .await;
        assert!(matches!(result, Err(MessagingError::Transport { .. })));
    }
}
