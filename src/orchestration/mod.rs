//! # Orchestration Engine
//!
//! Drives research data access workflows through an ordered plan of role steps.
//!
//! ## Core Components
//!
//! - **WorkflowOrchestrator**: submission, per-workflow execution tasks, cancellation and status
//! - **StepExecutor**: one request/response attempt against a role agent
//! - **RecoveryManager**: cached-result, fallback and escalation strategies after retries run out
//! - **ResultAggregator**: processing summary, per-role scores and compliance predicates
//! - **AuditTrail**: bounded record of every lifecycle transition
//! - **Compensation**: saga-style undo of committed steps when a workflow fails
//! - **OrchestrationSystem**: bootstrap that wires messaging, resilience and orchestration together

pub mod aggregation;
pub mod audit;
pub mod bootstrap;
pub mod compensation;
pub mod errors;
pub mod metrics;
pub mod orchestrator;
pub mod plan;
pub mod recovery;
pub mod step_executor;
pub mod types;

pub use aggregation::{
    AggregatedResults, ComplianceContext, CompliancePredicate, MinimumQualityPredicate,
    ProcessingSummary, QualityAssessment, ResultAggregator, RoleApprovalPredicate, RoleSummary,
};
pub use audit::{AuditEvent, AuditEventType, AuditFilter, AuditTrail};
pub use bootstrap::{OrchestrationSystem, SystemStatus};
pub use errors::{OrchestrationError, OrchestrationResult};
pub use metrics::{PerformanceTracker, RolePerformance};
pub use orchestrator::{OrchestratorCounters, OrchestratorStats, WorkflowOrchestrator};
pub use plan::{build_plan, PlanInput, StepSpec};
pub use recovery::{FallbackProvider, RecoveryManager, RecoveryOutcome};
pub use step_executor::{StepAttempt, StepExecutor};
pub use types::{
    CancelOutcome, CompensationAction, ErrorLogEntry, StepStatus, StepStatusReport,
    WorkflowExecution, WorkflowRef, WorkflowStatus, WorkflowStatusReport, WorkflowStep,
};
