//! # Workflow Orchestrator
//!
//! Central state machine for research data access workflows.
//!
//! ## Execution model
//!
//! Each submitted workflow runs on its own task, which exclusively owns the
//! [`WorkflowExecution`] until it terminates. After every transition the task
//! publishes a snapshot over a watch channel; status queries read snapshots and
//! never touch the live record. On termination the record moves to a read-only
//! history bounded by `history_capacity`, which drops the oldest workflows first.
//!
//! Steps run strictly in plan order. A failed attempt is retried with exponential
//! backoff up to the role's `max_retries`; once the budget is spent the role's
//! recovery strategy runs. A failed recovery, or the global workflow timeout,
//! fails the workflow and triggers saga compensation.
//!
//! Concurrency is capped by a semaphore: a submission past
//! `max_concurrent_workflows` is rejected immediately, never queued.

use super::aggregation::{CompliancePredicate, ResultAggregator};
use super::audit::{AuditEvent, AuditEventType, AuditFilter, AuditTrail};
use super::compensation;
use super::errors::{OrchestrationError, OrchestrationResult};
use super::metrics::{PerformanceTracker, RolePerformance};
use super::plan::{build_plan, PlanInput};
use super::recovery::{FallbackProvider, RecoveryManager, RecoveryOutcome};
use super::step_executor::StepExecutor;
use super::types::{
    CancelOutcome, StepStatus, WorkflowExecution, WorkflowStatus, WorkflowStatusReport,
    WorkflowStep,
};
use crate::communication::{CommunicationManager, CommunicationStatistics};
use crate::config::{AuditConfig, OrchestrationConfig};
use crate::constants::events;
use crate::logging::{log_step_operation, log_workflow_operation};
use crate::resilience::{BackoffPolicy, SystemCircuitBreakerMetrics};
use crate::roles::Role;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorCounters {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
}

/// Health snapshot returned by [`WorkflowOrchestrator::get_orchestrator_stats`]
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub active_workflows: usize,
    pub max_concurrent_workflows: usize,
    pub available_slots: usize,
    pub history_size: usize,
    pub counters: OrchestratorCounters,
    pub role_performance: BTreeMap<Role, RolePerformance>,
    pub audit_events: usize,
    pub circuit_breakers: SystemCircuitBreakerMetrics,
}

struct ActiveWorkflow {
    owner_id: String,
    snapshot: watch::Receiver<WorkflowExecution>,
    cancel: watch::Sender<bool>,
}

enum Termination {
    Completed,
    Failed(OrchestrationError),
    Cancelled,
}

/// Finished workflows in completion order
struct WorkflowHistory {
    capacity: usize,
    records: HashMap<Uuid, WorkflowExecution>,
    order: VecDeque<Uuid>,
}

impl WorkflowHistory {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, workflow_id: &Uuid) -> Option<&WorkflowExecution> {
        self.records.get(workflow_id)
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn insert(&mut self, execution: WorkflowExecution) {
        let workflow_id = execution.id;
        if self.records.insert(workflow_id, execution).is_none() {
            self.order.push_back(workflow_id);
        }
        while self.records.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.records.remove(&oldest);
            debug!(workflow_id = %oldest, "Dropped oldest workflow from history");
        }
    }
}

struct OrchestratorInner {
    config: OrchestrationConfig,
    communication: Arc<CommunicationManager>,
    executor: StepExecutor,
    recovery: RecoveryManager,
    aggregator: ResultAggregator,
    audit: AuditTrail,
    performance: PerformanceTracker,
    permits: Arc<Semaphore>,
    active: DashMap<Uuid, ActiveWorkflow>,
    history: RwLock<WorkflowHistory>,
    counters: Mutex<OrchestratorCounters>,
}

#[derive(Clone)]
pub struct WorkflowOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl fmt::Debug for WorkflowOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowOrchestrator")
            .field("active_workflows", &self.inner.active.len())
            .field(
                "max_concurrent_workflows",
                &self.inner.config.max_concurrent_workflows,
            )
            .finish()
    }
}

impl WorkflowOrchestrator {
    pub fn new(
        config: OrchestrationConfig,
        audit: AuditConfig,
        communication: Arc<CommunicationManager>,
    ) -> Self {
        info!(
            max_concurrent_workflows = config.max_concurrent_workflows,
            workflow_timeout_secs = config.workflow_timeout_secs,
            "🎼 Workflow orchestrator initialized"
        );

        let inner = OrchestratorInner {
            executor: StepExecutor::new(Arc::clone(&communication)),
            recovery: RecoveryManager::new(config.recovery_cache_capacity),
            aggregator: ResultAggregator::new(&config),
            audit: AuditTrail::new(audit),
            performance: PerformanceTracker::new(config.metrics_smoothing),
            permits: Arc::new(Semaphore::new(config.max_concurrent_workflows)),
            active: DashMap::new(),
            history: RwLock::new(WorkflowHistory::new(config.history_capacity)),
            counters: Mutex::new(OrchestratorCounters::default()),
            communication,
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &OrchestrationConfig {
        &self.inner.config
    }

    pub fn communication(&self) -> &Arc<CommunicationManager> {
        &self.inner.communication
    }

    /// Opt in to fabricated substitute outputs for `role`
    pub fn register_fallback(&self, role: Role, provider: Arc<dyn FallbackProvider>) {
        self.inner.recovery.register_fallback(role, provider);
    }

    pub fn add_compliance_predicate(&self, predicate: Arc<dyn CompliancePredicate>) {
        self.inner.aggregator.add_predicate(predicate);
    }

    /// Validate the plan and start executing it.
    ///
    /// Must be called from within a Tokio runtime. Fails synchronously with
    /// `ConcurrencyLimitExceeded` when every workflow slot is taken.
    #[instrument(skip(self, input), fields(query_id = %input.query_id, owner_id = %input.owner_id))]
    pub fn submit_workflow(&self, input: PlanInput) -> OrchestrationResult<Uuid> {
        let specs = build_plan(&input)?;

        let permit = match Arc::clone(&self.inner.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.inner.counters.lock().rejected += 1;
                let limit = self.inner.config.max_concurrent_workflows;
                warn!(limit, query_id = %input.query_id, "Workflow rejected: concurrency limit reached");
                return Err(OrchestrationError::ConcurrencyLimitExceeded { limit });
            }
        };

        let steps = specs
            .into_iter()
            .map(|spec| {
                let max_retries = self.inner.config.role_policy(spec.role).max_retries;
                WorkflowStep::new(spec.name, spec.role, spec.input, max_retries)
            })
            .collect();
        let execution = WorkflowExecution::new(input.query_id, input.owner_id, steps, input.metadata);
        let workflow_id = execution.id;

        self.inner.audit.record(
            &execution.audit_ref(),
            AuditEventType::WorkflowSubmitted,
            json!({
                "steps": execution.steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            }),
        );
        log_workflow_operation(
            events::WORKFLOW_SUBMITTED,
            workflow_id,
            Some(&execution.owner_id),
            "pending",
            None,
        );

        let (snapshot_tx, snapshot_rx) = watch::channel(execution.clone());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.inner.active.insert(
            workflow_id,
            ActiveWorkflow {
                owner_id: execution.owner_id.clone(),
                snapshot: snapshot_rx,
                cancel: cancel_tx,
            },
        );
        self.inner.counters.lock().submitted += 1;

        let inner = Arc::clone(&self.inner);
        tokio::spawn(inner.run_workflow(execution, snapshot_tx, cancel_rx, permit));
        Ok(workflow_id)
    }

    /// Snapshot of an active or finished workflow
    pub fn get_workflow_status(&self, workflow_id: Uuid) -> OrchestrationResult<WorkflowStatusReport> {
        if let Some(entry) = self.inner.active.get(&workflow_id) {
            let snapshot = entry.snapshot.borrow();
            return Ok(WorkflowStatusReport::from(&*snapshot));
        }
        self.inner
            .history
            .read()
            .get(&workflow_id)
            .map(WorkflowStatusReport::from)
            .ok_or(OrchestrationError::WorkflowNotFound { workflow_id })
    }

    /// Wait up to `timeout` for a workflow to terminate, then report its status
    pub async fn wait_for_completion(
        &self,
        workflow_id: Uuid,
        timeout: Duration,
    ) -> OrchestrationResult<WorkflowStatusReport> {
        let receiver = self
            .inner
            .active
            .get(&workflow_id)
            .map(|entry| entry.snapshot.clone());

        if let Some(mut receiver) = receiver {
            let _ = tokio::time::timeout(timeout, async move {
                receiver
                    .wait_for(|execution| execution.status.is_terminal())
                    .await
                    .is_ok()
            })
            .await;
        }
        self.get_workflow_status(workflow_id)
    }

    /// Cancel an active workflow on behalf of `requester` (its owner or an admin).
    ///
    /// Returns once the execution task has stopped. In-flight step calls are not
    /// aborted; their results are discarded.
    pub async fn cancel_workflow(&self, workflow_id: Uuid, requester: &str) -> CancelOutcome {
        let active = self
            .inner
            .active
            .get(&workflow_id)
            .map(|entry| (entry.owner_id.clone(), entry.snapshot.clone()));

        let Some((owner_id, mut snapshot)) = active else {
            return match self.inner.history.read().get(&workflow_id) {
                Some(done) if !self.inner.may_cancel(&done.owner_id, requester) => {
                    CancelOutcome::Unauthorized
                }
                Some(_) => CancelOutcome::AlreadyTerminal,
                None => CancelOutcome::NotFound,
            };
        };

        if !self.inner.may_cancel(&owner_id, requester) {
            warn!(%workflow_id, requester = %requester, "Unauthorized cancellation attempt");
            return CancelOutcome::Unauthorized;
        }

        let workflow = snapshot.borrow().audit_ref();
        self.inner.audit.record(
            &workflow,
            AuditEventType::CancelRequested,
            json!({ "requester": requester }),
        );
        log_workflow_operation(
            events::WORKFLOW_CANCEL_REQUESTED,
            workflow_id,
            Some(&owner_id),
            "cancelling",
            Some(requester),
        );
        if let Some(entry) = self.inner.active.get(&workflow_id) {
            entry.cancel.send_replace(true);
        }

        let status = match snapshot
            .wait_for(|execution| execution.status.is_terminal())
            .await
        {
            Ok(execution) => execution.status,
            Err(_) => self
                .inner
                .history
                .read()
                .get(&workflow_id)
                .map_or(WorkflowStatus::Failed, |done| done.status),
        };

        if status == WorkflowStatus::Cancelled {
            CancelOutcome::Cancelled
        } else {
            CancelOutcome::AlreadyTerminal
        }
    }

    pub fn get_audit_trail(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        self.inner.audit.query(filter)
    }

    pub fn active_workflow_ids(&self) -> Vec<Uuid> {
        self.inner.active.iter().map(|entry| *entry.key()).collect()
    }

    pub fn get_orchestrator_stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            active_workflows: self.inner.active.len(),
            max_concurrent_workflows: self.inner.config.max_concurrent_workflows,
            available_slots: self.inner.permits.available_permits(),
            history_size: self.inner.history.read().len(),
            counters: self.inner.counters.lock().clone(),
            role_performance: self.inner.performance.snapshot(),
            audit_events: self.inner.audit.len(),
            circuit_breakers: self.inner.communication.breakers().snapshot(),
        }
    }

    pub fn get_communication_statistics(&self) -> CommunicationStatistics {
        self.inner.communication.get_communication_statistics()
    }

    /// Cancel every active workflow and wait for their tasks to stop
    pub async fn shutdown(&self) {
        let receivers: Vec<watch::Receiver<WorkflowExecution>> = self
            .inner
            .active
            .iter()
            .map(|entry| {
                entry.cancel.send_replace(true);
                entry.snapshot.clone()
            })
            .collect();

        if !receivers.is_empty() {
            info!(active = receivers.len(), "🛑 Cancelling active workflows for shutdown");
        }
        for mut receiver in receivers {
            let _ = receiver
                .wait_for(|execution| execution.status.is_terminal())
                .await;
        }
    }
}

impl OrchestratorInner {
    fn may_cancel(&self, owner_id: &str, requester: &str) -> bool {
        owner_id == requester || self.config.admin_requesters.iter().any(|a| a == requester)
    }

    async fn run_workflow(
        self: Arc<Self>,
        mut execution: WorkflowExecution,
        snapshots: watch::Sender<WorkflowExecution>,
        cancel: watch::Receiver<bool>,
        permit: OwnedSemaphorePermit,
    ) {
        let workflow_id = execution.id;
        let workflow = execution.audit_ref();
        execution.status = WorkflowStatus::Running;
        execution.started_at = Some(Utc::now());
        snapshots.send_replace(execution.clone());
        self.audit.record(
            &workflow,
            AuditEventType::WorkflowStarted,
            json!({ "steps": execution.steps.len() }),
        );
        info!(%workflow_id, steps = execution.steps.len(), "🚀 Workflow started");

        let timeout = self.config.workflow_timeout();
        let termination = {
            let steps = self.execute_steps(&mut execution, &snapshots);
            tokio::select! {
                biased;
                _ = cancellation_requested(cancel) => Termination::Cancelled,
                outcome = tokio::time::timeout(timeout, steps) => match outcome {
                    Ok(Ok(())) => Termination::Completed,
                    Ok(Err(err)) => Termination::Failed(err),
                    Err(_) => Termination::Failed(OrchestrationError::WorkflowTimeout {
                        workflow_id,
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                },
            }
        };

        let final_event = match termination {
            Termination::Completed => {
                execution.results = Some(self.aggregator.aggregate(&execution));
                execution.status = WorkflowStatus::Completed;
                self.counters.lock().completed += 1;
                AuditEventType::WorkflowCompleted
            }
            Termination::Failed(err) => {
                let interrupted = interrupt_running_step(&mut execution, &err.to_string());
                if !matches!(err, OrchestrationError::RecoveryFailed { .. }) {
                    execution.log_error(err.error_code(), err.to_string(), interrupted.as_ref());
                }
                warn!(%workflow_id, code = err.error_code(), error = %err, "Workflow failed");
                compensation::run_compensations(
                    &self.communication,
                    &self.config,
                    &self.audit,
                    &mut execution,
                )
                .await;
                execution.status = WorkflowStatus::Failed;
                self.counters.lock().failed += 1;
                AuditEventType::WorkflowFailed
            }
            Termination::Cancelled => {
                let interrupted = interrupt_running_step(&mut execution, "workflow cancelled");
                let cancelled = OrchestrationError::Cancelled { workflow_id };
                execution.log_error(
                    cancelled.error_code(),
                    cancelled.to_string(),
                    interrupted.as_ref(),
                );
                execution.status = WorkflowStatus::Cancelled;
                self.counters.lock().cancelled += 1;
                AuditEventType::WorkflowCancelled
            }
        };
        execution.completed_at = Some(Utc::now());

        let status = execution.status;
        self.audit.record(
            &workflow,
            final_event,
            json!({
                "status": status,
                "total_retries": execution.total_retries(),
                "errors": execution.error_log.len(),
            }),
        );
        log_workflow_operation(
            events::WORKFLOW_FINALIZED,
            workflow_id,
            Some(&execution.owner_id),
            &format!("{status:?}").to_lowercase(),
            None,
        );

        // History first, so a lookup never misses a finalized workflow. The slot is
        // released before waiters observe the terminal snapshot.
        let final_snapshot = execution.clone();
        self.history.write().insert(execution);
        self.active.remove(&workflow_id);
        drop(permit);
        snapshots.send_replace(final_snapshot);
        info!(%workflow_id, ?status, "🏁 Workflow finalized");
    }

    async fn execute_steps(
        &self,
        execution: &mut WorkflowExecution,
        snapshots: &watch::Sender<WorkflowExecution>,
    ) -> OrchestrationResult<()> {
        for index in 0..execution.steps.len() {
            self.run_step(execution, index, snapshots).await?;
        }
        Ok(())
    }

    #[instrument(
        skip(self, execution, snapshots),
        fields(workflow_id = %execution.id, step = %execution.steps[index].name)
    )]
    async fn run_step(
        &self,
        execution: &mut WorkflowExecution,
        index: usize,
        snapshots: &watch::Sender<WorkflowExecution>,
    ) -> OrchestrationResult<()> {
        let workflow = execution.audit_ref();
        let role = execution.steps[index].role;
        let step_name = execution.steps[index].name.clone();
        let policy = self.config.role_policy(role);
        let backoff = BackoffPolicy::new(policy.base_delay, policy.backoff_factor, policy.max_delay);
        let request =
            StepExecutor::build_request(execution.id, &execution.steps[index], execution.step_context());

        let last_error = loop {
            let attempt_number = {
                let step = &mut execution.steps[index];
                step.status = StepStatus::Running;
                step.started_at.get_or_insert_with(Utc::now);
                step.retry_count + 1
            };
            snapshots.send_replace(execution.clone());
            self.audit.record(
                &workflow,
                AuditEventType::StepStarted,
                json!({ "step": step_name, "role": role, "attempt": attempt_number }),
            );
            log_step_operation(
                events::STEP_ATTEMPT,
                workflow.workflow_id,
                &step_name,
                role.as_str(),
                "running",
                None,
            );

            let attempt = self.executor.execute_attempt(request.clone(), &policy).await;
            if attempt.reached_handler() {
                self.performance
                    .record(role, attempt.result.is_ok(), attempt.elapsed);
            }

            match attempt.result {
                Ok(output) => {
                    self.recovery
                        .remember(policy.recovery, role, &request.input, &output);
                    {
                        let step = &mut execution.steps[index];
                        step.status = StepStatus::Completed;
                        step.output = Some(output);
                        step.error = None;
                        step.completed_at = Some(Utc::now());
                    }
                    if let Some(action) = compensation::action_for(&execution.steps[index]) {
                        execution.compensations.push(action);
                    }
                    self.audit.record(
                        &workflow,
                        AuditEventType::StepCompleted,
                        json!({ "step": step_name, "role": role, "attempts": attempt_number }),
                    );
                    log_step_operation(
                        events::STEP_COMPLETED,
                        workflow.workflow_id,
                        &step_name,
                        role.as_str(),
                        "completed",
                        None,
                    );
                    snapshots.send_replace(execution.clone());
                    return Ok(());
                }
                Err(err) => {
                    if matches!(err, OrchestrationError::CircuitOpen { .. }) {
                        self.audit.record(
                            &workflow,
                            AuditEventType::CircuitRejected,
                            json!({ "step": step_name, "role": role }),
                        );
                    }
                    self.audit.record(
                        &workflow,
                        AuditEventType::StepFailed,
                        json!({
                            "step": step_name,
                            "role": role,
                            "attempt": attempt_number,
                            "code": err.error_code(),
                            "error": err.to_string(),
                        }),
                    );

                    let step = &mut execution.steps[index];
                    step.status = StepStatus::Failed;
                    step.error = Some(err.to_string());

                    if err.is_retryable() && step.retry_count < step.max_retries {
                        let delay = backoff.delay_for(step.retry_count);
                        step.retry_count += 1;
                        step.status = StepStatus::Pending;
                        let retry = step.retry_count;
                        self.audit.record(
                            &workflow,
                            AuditEventType::StepRetried,
                            json!({
                                "step": step_name,
                                "role": role,
                                "retry": retry,
                                "delay_ms": delay.as_millis() as u64,
                            }),
                        );
                        log_step_operation(
                            events::STEP_FAILED,
                            workflow.workflow_id,
                            &step_name,
                            role.as_str(),
                            "pending",
                            Some(err.to_string().as_str()),
                        );
                        snapshots.send_replace(execution.clone());
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    snapshots.send_replace(execution.clone());
                    break err;
                }
            }
        };

        let exhausted = OrchestrationError::RetryExhausted {
            step: step_name.clone(),
            role,
            attempts: execution.steps[index].retry_count + 1,
            last_error: last_error.to_string(),
        };
        let failed_step = execution.steps[index].clone();
        execution.log_error(exhausted.error_code(), exhausted.to_string(), Some(&failed_step));
        self.audit.record(
            &workflow,
            AuditEventType::RecoveryAttempted,
            json!({ "step": step_name, "role": role, "strategy": policy.recovery }),
        );

        match self
            .recovery
            .recover(policy.recovery, &request, &last_error.to_string())
            .await
        {
            RecoveryOutcome::Recovered { output, via } => {
                {
                    let step = &mut execution.steps[index];
                    step.status = StepStatus::Completed;
                    step.output = Some(output);
                    step.low_confidence = true;
                    step.recovered_via = Some(via);
                    step.completed_at = Some(Utc::now());
                }
                self.audit.record(
                    &workflow,
                    AuditEventType::RecoverySuccess,
                    json!({ "step": step_name, "role": role, "via": via }),
                );
                warn!(
                    workflow_id = %workflow.workflow_id,
                    step = %step_name,
                    role = %role,
                    ?via,
                    "♻️ Step recovered with a low-confidence output"
                );
                snapshots.send_replace(execution.clone());
                Ok(())
            }
            RecoveryOutcome::Escalated { reason } => {
                self.audit.record(
                    &workflow,
                    AuditEventType::EscalationRaised,
                    json!({ "step": step_name, "role": role, "reason": reason }),
                );
                Err(self.recovery_failed(execution, &failed_step, reason))
            }
            RecoveryOutcome::Failed { reason } => {
                Err(self.recovery_failed(execution, &failed_step, reason))
            }
        }
    }

    fn recovery_failed(
        &self,
        execution: &mut WorkflowExecution,
        step: &WorkflowStep,
        reason: String,
    ) -> OrchestrationError {
        let err = OrchestrationError::recovery_failed(&step.name, step.role, reason);
        self.audit.record(
            &execution.audit_ref(),
            AuditEventType::RecoveryFailed,
            json!({ "step": step.name, "role": step.role, "error": err.to_string() }),
        );
        execution.log_error(err.error_code(), err.to_string(), Some(step));
        err
    }
}

/// Resolves once cancellation is requested; never resolves if the sender is gone
async fn cancellation_requested(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Mark the step that was running (if any) as failed, returning a copy of it
fn interrupt_running_step(execution: &mut WorkflowExecution, reason: &str) -> Option<WorkflowStep> {
    let step = execution
        .steps
        .iter_mut()
        .find(|step| step.status == StepStatus::Running)?;
    step.status = StepStatus::Failed;
    step.error = Some(reason.to_string());
    Some(step.clone())
}
