//! # Orchestration Error Types
//!
//! Step-level failures are retried and recovered locally; only the fatal ones
//! surface as a FAILED workflow with an error-log entry carrying [`OrchestrationError::error_code`].

use crate::communication::CommunicationError;
use crate::messaging::delivery::ACK_TIMEOUT_REASON;
use crate::roles::Role;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestrationError {
    /// Message could not be handed to the role's handler
    #[error("Transport failure reaching {role}: {message}")]
    TransportFailure { role: Role, message: String },

    #[error("Acknowledgment from {role} timed out")]
    AckTimeout { role: Role },

    /// Fail-fast rejection; no transport attempt was made
    #[error("Circuit breaker open for {role}")]
    CircuitOpen { role: Role },

    /// Nominally successful response that breaks the role's output contract
    #[error("Step {step} ({role}) output is missing required fields: {missing:?}")]
    StepOutputInvalid {
        step: String,
        role: Role,
        missing: Vec<String>,
    },

    #[error("Step {step} ({role}) timed out after {timeout_ms}ms")]
    StepTimeout {
        step: String,
        role: Role,
        timeout_ms: u64,
    },

    #[error("Handler for {role} failed: {message}")]
    RemoteFailure { role: Role, message: String },

    #[error("Step {step} ({role}) exhausted {attempts} attempts: {last_error}")]
    RetryExhausted {
        step: String,
        role: Role,
        attempts: u32,
        last_error: String,
    },

    #[error("Recovery failed for step {step} ({role}): {reason}")]
    RecoveryFailed {
        step: String,
        role: Role,
        reason: String,
    },

    #[error("Workflow {workflow_id} exceeded its {timeout_ms}ms timeout")]
    WorkflowTimeout { workflow_id: Uuid, timeout_ms: u64 },

    #[error("Concurrent workflow limit of {limit} reached")]
    ConcurrencyLimitExceeded { limit: usize },

    #[error("Invalid workflow plan: {reason}")]
    InvalidPlan { reason: String },

    #[error("Workflow not found: {workflow_id}")]
    WorkflowNotFound { workflow_id: Uuid },

    #[error("Workflow {workflow_id} was cancelled")]
    Cancelled { workflow_id: Uuid },
}

impl OrchestrationError {
    pub fn invalid_plan(reason: impl Into<String>) -> Self {
        Self::InvalidPlan {
            reason: reason.into(),
        }
    }

    pub fn recovery_failed(step: impl Into<String>, role: Role, reason: impl Into<String>) -> Self {
        Self::RecoveryFailed {
            step: step.into(),
            role,
            reason: reason.into(),
        }
    }

    /// Classify a communication failure for a step attempt
    pub fn from_step_failure(step: &str, role: Role, error: CommunicationError) -> Self {
        match error {
            CommunicationError::CircuitOpen { .. } => Self::CircuitOpen { role },
            CommunicationError::Timeout { timeout_ms, .. } => Self::StepTimeout {
                step: step.to_string(),
                role,
                timeout_ms,
            },
            CommunicationError::DeadLettered { reason, .. } if reason == ACK_TIMEOUT_REASON => {
                Self::AckTimeout { role }
            }
            CommunicationError::DeadLettered { reason, .. } => Self::TransportFailure {
                role,
                message: reason,
            },
            CommunicationError::RemoteFailure { message, .. } => {
                Self::RemoteFailure { role, message }
            }
            CommunicationError::InvalidResponse { missing, .. } => Self::StepOutputInvalid {
                step: step.to_string(),
                role,
                missing,
            },
            other => Self::TransportFailure {
                role,
                message: other.to_string(),
            },
        }
    }

    /// Stable code recorded in workflow error logs
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TransportFailure { .. } => "TRANSPORT_FAILURE",
            Self::AckTimeout { .. } => "ACK_TIMEOUT",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::StepOutputInvalid { .. } => "STEP_OUTPUT_INVALID",
            Self::StepTimeout { .. } => "STEP_TIMEOUT",
            Self::RemoteFailure { .. } => "REMOTE_FAILURE",
            Self::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Self::RecoveryFailed { .. } => "RECOVERY_FAILED",
            Self::WorkflowTimeout { .. } => "WORKFLOW_TIMEOUT",
            Self::ConcurrencyLimitExceeded { .. } => "CONCURRENCY_LIMIT_EXCEEDED",
            Self::InvalidPlan { .. } => "INVALID_PLAN",
            Self::WorkflowNotFound { .. } => "WORKFLOW_NOT_FOUND",
            Self::Cancelled { .. } => "CANCELLED",
        }
    }

    /// Whether a step attempt failing with this error may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransportFailure { .. }
                | Self::AckTimeout { .. }
                | Self::CircuitOpen { .. }
                | Self::StepOutputInvalid { .. }
                | Self::StepTimeout { .. }
                | Self::RemoteFailure { .. }
        )
    }

    /// Role the failure is attributed to, when there is one
    pub fn role(&self) -> Option<Role> {
        match self {
            Self::TransportFailure { role, .. }
            | Self::AckTimeout { role }
            | Self::CircuitOpen { role }
            | Self::StepOutputInvalid { role, .. }
            | Self::StepTimeout { role, .. }
            | Self::RemoteFailure { role, .. }
            | Self::RetryExhausted { role, .. }
            | Self::RecoveryFailed { role, .. } => Some(*role),
            _ => None,
        }
    }
}

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;
