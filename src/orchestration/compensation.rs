//! # Saga Compensation
//!
//! Committed steps whose role defines an undo action register a
//! [`CompensationAction`]. When a workflow fails, every pending action is sent to
//! its role concurrently, newest registration first, and all of them are awaited
//! before the workflow is finalized.

use super::audit::{AuditEventType, AuditTrail};
use super::types::{CompensationAction, WorkflowExecution, WorkflowStep};
use crate::communication::{CommunicationManager, RequestOptions};
use crate::config::OrchestrationConfig;
use crate::messaging::{CompensationRequest, MessageKind, MessagePayload, MessagePriority};
use futures::future::join_all;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

/// Undo action for a freshly committed step, if its role has one
pub fn action_for(step: &WorkflowStep) -> Option<CompensationAction> {
    let action_type = step.role.compensation_action()?;
    Some(CompensationAction {
        id: Uuid::new_v4(),
        step_name: step.name.clone(),
        role: step.role,
        action_type: action_type.to_string(),
        payload: json!({
            "step_id": step.id,
            "step_name": step.name,
            "input": step.input,
            "output": step.output,
        }),
        executed: false,
        succeeded: None,
        error: None,
    })
}

/// Execute every pending compensation on `execution`, returning how many succeeded
pub async fn run_compensations(
    communication: &CommunicationManager,
    config: &OrchestrationConfig,
    audit: &AuditTrail,
    execution: &mut WorkflowExecution,
) -> usize {
    let workflow_id = execution.id;
    let pending: Vec<usize> = (0..execution.compensations.len())
        .rev()
        .filter(|&index| !execution.compensations[index].executed)
        .collect();
    if pending.is_empty() {
        return 0;
    }

    info!(%workflow_id, actions = pending.len(), "↩️ Running compensations");

    let sends = pending.iter().map(|&index| {
        let action = &execution.compensations[index];
        let request = CompensationRequest {
            action_id: action.id,
            workflow_id,
            role: action.role,
            action_type: action.action_type.clone(),
            payload: action.payload.clone(),
        };
        let options = RequestOptions {
            timeout: Some(config.role_policy(action.role).timeout),
            priority: MessagePriority::Critical,
            ..Default::default()
        };
        let recipient = action.role.agent_id();
        async move {
            communication
                .send_request_response(
                    &recipient,
                    MessageKind::Compensation,
                    MessagePayload::Compensation(request),
                    options,
                )
                .await
        }
    });
    let results = join_all(sends).await;

    let workflow = execution.audit_ref();
    let mut succeeded = 0;
    for (index, result) in pending.into_iter().zip(results) {
        let action = &mut execution.compensations[index];
        action.executed = true;
        let details = json!({
            "action_id": action.id,
            "action_type": action.action_type,
            "step": action.step_name,
            "role": action.role,
        });
        match result {
            Ok(_) => {
                action.succeeded = Some(true);
                succeeded += 1;
                audit.record(&workflow, AuditEventType::CompensationExecuted, details);
            }
            Err(err) => {
                warn!(
                    %workflow_id,
                    action = %action.action_type,
                    step = %action.step_name,
                    error = %err,
                    "Compensation failed"
                );
                action.succeeded = Some(false);
                action.error = Some(err.to_string());
                let mut details = details;
                details["error"] = json!(err.to_string());
                audit.record(&workflow, AuditEventType::CompensationFailed, details);
            }
        }
    }
    succeeded
}
