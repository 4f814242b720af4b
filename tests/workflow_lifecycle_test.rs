//! Cancellation, timeout, compensation, audit and status behavior of workflows

mod common;

use common::{fast_config, start_system, standard_output, Harness, ScriptedHandler};
use research_relay::orchestration::{
    AuditEventType, AuditFilter, CancelOutcome, PlanInput, StepSpec, StepStatus, WorkflowStatus,
};
use research_relay::roles::Role;
use serde_json::json;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn slow(role: Role, millis: u64) -> std::sync::Arc<ScriptedHandler> {
    ScriptedHandler::slow(Duration::from_millis(millis), standard_output(role))
}

fn single_step(query_id: &str, owner_id: &str, role: Role) -> PlanInput {
    PlanInput::new(query_id, owner_id).with_steps(vec![StepSpec::new(
        role.as_str(),
        role,
        json!({}),
    )])
}

#[tokio::test]
async fn test_owner_cancels_running_workflow() {
    let harness = Harness::standard().with(Role::Validation, slow(Role::Validation, 1_000));
    let (system, _transport) = start_system(fast_config(), &harness);
    let orchestrator = system.orchestrator();

    let workflow_id = orchestrator
        .submit_workflow(single_step("q-cancel", "researcher-1", Role::Validation))
        .expect("submitted");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        orchestrator.cancel_workflow(workflow_id, "researcher-1").await,
        CancelOutcome::Cancelled
    );

    let report = orchestrator.get_workflow_status(workflow_id).expect("in history");
    assert_eq!(report.status, WorkflowStatus::Cancelled);
    assert_eq!(report.steps[0].status, StepStatus::Failed);
    assert_eq!(report.steps[0].error.as_deref(), Some("workflow cancelled"));
    assert!(report.completed_at.is_some());

    assert_eq!(
        orchestrator.cancel_workflow(workflow_id, "researcher-1").await,
        CancelOutcome::AlreadyTerminal
    );

    let stats = orchestrator.get_orchestrator_stats();
    assert_eq!(stats.counters.cancelled, 1);
    assert_eq!(stats.active_workflows, 0);
    assert_eq!(stats.available_slots, stats.max_concurrent_workflows);

    let audit = orchestrator.get_audit_trail(&AuditFilter::for_workflow(workflow_id));
    let kinds: Vec<AuditEventType> = audit.iter().map(|e| e.event_type).collect();
    assert!(kinds.contains(&AuditEventType::CancelRequested));
    assert_eq!(kinds.last(), Some(&AuditEventType::WorkflowCancelled));

    system.shutdown().await;
}

#[tokio::test]
async fn test_only_owner_or_admin_may_cancel() {
    let mut config = fast_config();
    config.orchestration.admin_requesters = vec!["compliance-officer".to_string()];
    let harness = Harness::standard().with(Role::Validation, slow(Role::Validation, 1_000));
    let (system, _transport) = start_system(config, &harness);
    let orchestrator = system.orchestrator();

    let workflow_id = orchestrator
        .submit_workflow(single_step("q-admin", "researcher-1", Role::Validation))
        .expect("submitted");

    assert_eq!(
        orchestrator.cancel_workflow(workflow_id, "intruder").await,
        CancelOutcome::Unauthorized
    );
    assert!(!orchestrator
        .get_workflow_status(workflow_id)
        .expect("active")
        .status
        .is_terminal());

    assert_eq!(
        orchestrator
            .cancel_workflow(workflow_id, "compliance-officer")
            .await,
        CancelOutcome::Cancelled
    );

    system.shutdown().await;
}

#[tokio::test]
async fn test_global_timeout_fails_and_compensates() {
    let mut config = fast_config();
    config.orchestration.workflow_timeout_secs = 1;
    config.orchestration.default_step_timeout_ms = 5_000;
    let harness = Harness::standard().with(Role::EthicsReview, slow(Role::EthicsReview, 3_000));
    let (system, _transport) = start_system(config, &harness);

    let input = PlanInput::new("q-timeout", "researcher-1").with_steps(vec![
        StepSpec::new("consent_check:ehr", Role::ConsentCheck, json!({ "data_source": "ehr" })),
        StepSpec::new("ethics_review", Role::EthicsReview, json!({})),
    ]);
    let workflow_id = system.orchestrator().submit_workflow(input).expect("submitted");
    let report = system
        .orchestrator()
        .wait_for_completion(workflow_id, WAIT)
        .await
        .expect("known workflow");

    assert_eq!(report.status, WorkflowStatus::Failed);
    let timeout = report
        .error_log
        .iter()
        .find(|entry| entry.code == "WORKFLOW_TIMEOUT")
        .expect("timeout logged");
    assert_eq!(timeout.step.as_deref(), Some("ethics_review"));
    assert_eq!(report.steps[1].status, StepStatus::Failed);

    assert_eq!(harness.handler(Role::ConsentCheck).compensations(), 1);
    assert_eq!(report.compensations.len(), 1);
    assert!(report.compensations[0].executed);
    assert_eq!(report.compensations[0].succeeded, Some(true));
    assert_eq!(report.compensations[0].action_type, "release_consent_hold");

    let executed = system.orchestrator().get_audit_trail(
        &AuditFilter::for_workflow(workflow_id)
            .with_event_type(AuditEventType::CompensationExecuted),
    );
    assert_eq!(executed.len(), 1);

    system.shutdown().await;
}

#[tokio::test]
async fn test_failed_compensations_are_recorded_newest_first() {
    let harness = Harness::standard()
        .with(
            Role::ConsentCheck,
            ScriptedHandler::with_failing_compensation(standard_output(Role::ConsentCheck)),
        )
        .with(Role::DataRetrieval, ScriptedHandler::failing());
    let (system, _transport) = start_system(fast_config(), &harness);

    let workflow_id = system
        .orchestrator()
        .submit_workflow(
            PlanInput::new("q-compensate", "researcher-1").with_data_sources(["ehr", "registry"]),
        )
        .expect("submitted");
    let report = system
        .orchestrator()
        .wait_for_completion(workflow_id, WAIT)
        .await
        .expect("known workflow");

    assert_eq!(report.status, WorkflowStatus::Failed);
    assert_eq!(harness.handler(Role::ConsentCheck).compensations(), 2);
    assert!(report
        .compensations
        .iter()
        .all(|c| c.executed && c.succeeded == Some(false) && c.error.is_some()));

    let failed = system.orchestrator().get_audit_trail(
        &AuditFilter::for_workflow(workflow_id).with_event_type(AuditEventType::CompensationFailed),
    );
    let steps: Vec<&str> = failed
        .iter()
        .map(|e| e.details["step"].as_str().unwrap_or_default())
        .collect();
    assert_eq!(steps, ["consent_check:registry", "consent_check:ehr"]);

    system.shutdown().await;
}

#[tokio::test]
async fn test_audit_records_lifecycle_in_order() {
    let harness = Harness::standard();
    let (system, _transport) = start_system(fast_config(), &harness);

    let workflow_id = system
        .orchestrator()
        .submit_workflow(single_step("q-audit", "researcher-1", Role::Validation))
        .expect("submitted");
    system
        .orchestrator()
        .wait_for_completion(workflow_id, WAIT)
        .await
        .expect("known workflow");

    let kinds: Vec<AuditEventType> = system
        .orchestrator()
        .get_audit_trail(&AuditFilter::for_workflow(workflow_id))
        .iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        kinds,
        [
            AuditEventType::WorkflowSubmitted,
            AuditEventType::WorkflowStarted,
            AuditEventType::StepStarted,
            AuditEventType::StepCompleted,
            AuditEventType::WorkflowCompleted,
        ]
    );

    let newest = system
        .orchestrator()
        .get_audit_trail(&AuditFilter::for_workflow(workflow_id).with_limit(1));
    assert_eq!(newest[0].event_type, AuditEventType::WorkflowCompleted);
    assert_eq!(newest[0].query_id, "q-audit");
    assert_eq!(newest[0].owner_id, "researcher-1");

    system.shutdown().await;
}

#[tokio::test]
async fn test_status_queries_are_read_only() {
    let harness = Harness::standard();
    let (system, _transport) = start_system(fast_config(), &harness);
    let orchestrator = system.orchestrator();

    let workflow_id = orchestrator
        .submit_workflow(single_step("q-status", "researcher-1", Role::Validation))
        .expect("submitted");
    let finished = orchestrator
        .wait_for_completion(workflow_id, WAIT)
        .await
        .expect("known workflow");

    let audit_len = orchestrator.get_orchestrator_stats().audit_events;
    for _ in 0..3 {
        assert_eq!(
            orchestrator.get_workflow_status(workflow_id).expect("in history"),
            finished
        );
    }
    assert_eq!(orchestrator.get_orchestrator_stats().audit_events, audit_len);
    assert_eq!(harness.handler(Role::Validation).calls(), 1);

    system.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_active_workflows() {
    let harness = Harness::standard().with(Role::Validation, slow(Role::Validation, 2_000));
    let (system, _transport) = start_system(fast_config(), &harness);

    let workflow_id = system
        .orchestrator()
        .submit_workflow(single_step("q-shutdown", "researcher-1", Role::Validation))
        .expect("submitted");
    assert_eq!(system.status().active_workflows, 1);

    system.shutdown().await;

    let status = system.status();
    assert!(!status.running);
    assert_eq!(status.active_workflows, 0);
    assert_eq!(
        system
            .orchestrator()
            .get_workflow_status(workflow_id)
            .expect("in history")
            .status,
        WorkflowStatus::Cancelled
    );
}
