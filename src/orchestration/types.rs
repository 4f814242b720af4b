//! # Orchestration Types
//!
//! Workflow and step records plus the read-only views handed to callers.
//!
//! A [`WorkflowExecution`] is owned by its execution task while active; everyone
//! else sees clones published after each transition.

use super::aggregation::AggregatedResults;
use crate::roles::{RecoveryStrategy, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: Uuid,
    pub name: String,
    pub role: Role,
    pub status: StepStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Output was produced by recovery rather than the role handler
    pub low_confidence: bool,
    pub recovered_via: Option<RecoveryStrategy>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowStep {
    pub fn new(name: impl Into<String>, role: Role, input: serde_json::Value, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            role,
            status: StepStatus::Pending,
            input,
            output: None,
            error: None,
            retry_count: 0,
            max_retries,
            low_confidence: false,
            recovered_via: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

/// Structured failure record kept on a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub code: String,
    pub message: String,
    pub step: Option<String>,
    pub role: Option<Role>,
    pub occurred_at: DateTime<Utc>,
}

/// Saga-style undo registered for a committed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationAction {
    pub id: Uuid,
    pub step_name: String,
    pub role: Role,
    pub action_type: String,
    pub payload: serde_json::Value,
    pub executed: bool,
    /// Outcome once executed; `None` while pending
    pub succeeded: Option<bool>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub query_id: String,
    pub owner_id: String,
    pub status: WorkflowStatus,
    pub steps: Vec<WorkflowStep>,
    pub results: Option<AggregatedResults>,
    pub error_log: Vec<ErrorLogEntry>,
    pub compensations: Vec<CompensationAction>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn new(
        query_id: impl Into<String>,
        owner_id: impl Into<String>,
        steps: Vec<WorkflowStep>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            query_id: query_id.into(),
            owner_id: owner_id.into(),
            status: WorkflowStatus::Pending,
            steps,
            results: None,
            error_log: Vec::new(),
            compensations: Vec::new(),
            metadata,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn audit_ref(&self) -> WorkflowRef {
        WorkflowRef {
            workflow_id: self.id,
            query_id: self.query_id.clone(),
            owner_id: self.owner_id.clone(),
        }
    }

    /// Outputs of completed steps keyed by step name, fed to later steps
    pub fn step_context(&self) -> BTreeMap<String, serde_json::Value> {
        self.steps
            .iter()
            .filter(|step| step.is_completed())
            .filter_map(|step| Some((step.name.clone(), step.output.clone()?)))
            .collect()
    }

    pub fn log_error(&mut self, code: &str, message: impl Into<String>, step: Option<&WorkflowStep>) {
        self.error_log.push(ErrorLogEntry {
            code: code.to_string(),
            message: message.into(),
            step: step.map(|s| s.name.clone()),
            role: step.map(|s| s.role),
            occurred_at: Utc::now(),
        });
    }

    pub fn total_retries(&self) -> u32 {
        self.steps.iter().map(|step| step.retry_count).sum()
    }
}

/// Identifiers every audit record is tagged with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRef {
    pub workflow_id: Uuid,
    pub query_id: String,
    pub owner_id: String,
}

/// Result of [`cancel_workflow`](super::WorkflowOrchestrator::cancel_workflow)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    Unauthorized,
    AlreadyTerminal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatusReport {
    pub name: String,
    pub role: Role,
    pub status: StepStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub low_confidence: bool,
    pub recovered_via: Option<RecoveryStrategy>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of a workflow, active or historical
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatusReport {
    pub workflow_id: Uuid,
    pub query_id: String,
    pub owner_id: String,
    pub status: WorkflowStatus,
    pub steps: Vec<StepStatusReport>,
    pub total_retries: u32,
    pub low_confidence_steps: Vec<String>,
    pub error_log: Vec<ErrorLogEntry>,
    pub compensations: Vec<CompensationAction>,
    pub results: Option<AggregatedResults>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&WorkflowExecution> for WorkflowStatusReport {
    fn from(execution: &WorkflowExecution) -> Self {
        Self {
            workflow_id: execution.id,
            query_id: execution.query_id.clone(),
            owner_id: execution.owner_id.clone(),
            status: execution.status,
            steps: execution
                .steps
                .iter()
                .map(|step| StepStatusReport {
                    name: step.name.clone(),
                    role: step.role,
                    status: step.status,
                    retry_count: step.retry_count,
                    max_retries: step.max_retries,
                    low_confidence: step.low_confidence,
                    recovered_via: step.recovered_via,
                    error: step.error.clone(),
                    started_at: step.started_at,
                    completed_at: step.completed_at,
                })
                .collect(),
            total_retries: execution.total_retries(),
            low_confidence_steps: execution
                .steps
                .iter()
                .filter(|step| step.low_confidence)
                .map(|step| step.name.clone())
                .collect(),
            error_log: execution.error_log.clone(),
            compensations: execution.compensations.clone(),
            results: execution.results.clone(),
            created_at: execution.created_at,
            started_at: execution.started_at,
            completed_at: execution.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_context_only_includes_completed_outputs() {
        let mut done = WorkflowStep::new("validation", Role::Validation, json!({}), 2);
        done.status = StepStatus::Completed;
        done.output = Some(json!({"valid": true}));
        let pending = WorkflowStep::new("consent_check", Role::ConsentCheck, json!({}), 3);

        let execution =
            WorkflowExecution::new("q-1", "owner", vec![done, pending], BTreeMap::new());
        let context = execution.step_context();
        assert_eq!(context.len(), 1);
        assert_eq!(context["validation"]["valid"], true);
    }

    #[test]
    fn test_status_report_reflects_retries_and_flags() {
        let mut step = WorkflowStep::new("anonymization", Role::Anonymization, json!({}), 2);
        step.retry_count = 2;
        step.low_confidence = true;
        let mut execution = WorkflowExecution::new("q-1", "owner", vec![step], BTreeMap::new());
        let first = execution.steps[0].clone();
        execution.log_error("RETRY_EXHAUSTED", "gave up", Some(&first));

        let report = WorkflowStatusReport::from(&execution);
        assert_eq!(report.total_retries, 2);
        assert_eq!(report.low_confidence_steps, vec!["anonymization".to_string()]);
        assert_eq!(report.error_log[0].role, Some(Role::Anonymization));
        assert!(!report.status.is_terminal());
    }
}
