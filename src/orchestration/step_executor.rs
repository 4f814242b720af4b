//! # Step Executor
//!
//! Runs one attempt of a workflow step: wraps the step in a [`StepRequest`],
//! sends it to the role's agent through the communication manager and classifies
//! the outcome.
//!
//! The communication manager enforces the parts that make an attempt fail fast or
//! fail despite a response:
//!
//! - **Circuit breaker**: an open breaker for the role's agent rejects the attempt
//!   before any transport call
//! - **Per-step timeout**: the role policy's timeout bounds the request
//! - **Output contract**: a response missing one of the role's required fields is a failure
//!
//! Retries, backoff and recovery belong to the orchestrator; each attempt here is a
//! single delivery with no redelivery.

use super::errors::{OrchestrationError, OrchestrationResult};
use super::types::WorkflowStep;
use crate::communication::{CommunicationManager, RequestOptions};
use crate::messaging::{MessageKind, MessagePayload, MessagePriority, StepRequest};
use crate::roles::RolePolicy;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Outcome of one step attempt with its wall-clock duration
#[derive(Debug, Clone)]
pub struct StepAttempt {
    pub result: OrchestrationResult<serde_json::Value>,
    pub elapsed: Duration,
}

impl StepAttempt {
    /// Whether a handler was actually reached (breaker rejections never are)
    pub fn reached_handler(&self) -> bool {
        !matches!(self.result, Err(OrchestrationError::CircuitOpen { .. }))
    }
}

#[derive(Debug, Clone)]
pub struct StepExecutor {
    communication: Arc<CommunicationManager>,
}

impl StepExecutor {
    pub fn new(communication: Arc<CommunicationManager>) -> Self {
        Self { communication }
    }

    pub fn build_request(
        workflow_id: Uuid,
        step: &WorkflowStep,
        context: BTreeMap<String, serde_json::Value>,
    ) -> StepRequest {
        StepRequest {
            workflow_id,
            step_id: step.id,
            step_name: step.name.clone(),
            role: step.role,
            input: step.input.clone(),
            context,
        }
    }

    #[instrument(skip(self, request, policy), fields(step = %request.step_name, role = %request.role))]
    pub async fn execute_attempt(&self, request: StepRequest, policy: &RolePolicy) -> StepAttempt {
        let role = request.role;
        let step_name = request.step_name.clone();
        let options = RequestOptions {
            timeout: Some(policy.timeout),
            priority: MessagePriority::High,
            max_retries: Some(0),
            required_fields: role
                .required_fields()
                .iter()
                .map(|field| field.to_string())
                .collect(),
        };

        let started = Instant::now();
        let result = self
            .communication
            .send_request_response(
                &role.agent_id(),
                MessageKind::StepRequest,
                MessagePayload::StepRequest(request),
                options,
            )
            .await
            .map_err(|err| OrchestrationError::from_step_failure(&step_name, role, err));
        let elapsed = started.elapsed();

        debug!(
            step = %step_name,
            role = %role,
            success = result.is_ok(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Step attempt finished"
        );
        StepAttempt { result, elapsed }
    }
}
