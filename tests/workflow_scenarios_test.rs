//! End-to-end workflow scenarios against in-process role handlers

mod common;

use async_trait::async_trait;
use common::{fast_config, init_test_logging, start_system, standard_output, Harness, ScriptedHandler};
use research_relay::config::RolePolicyOverride;
use research_relay::messaging::StepRequest;
use research_relay::orchestration::{
    AuditEventType, AuditFilter, FallbackProvider, OrchestrationError, PlanInput, StepSpec,
    StepStatus, WorkflowStatus,
};
use research_relay::roles::{RecoveryStrategy, Role};
use research_relay::CircuitState;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct SyntheticRetrieval;

#[async_trait]
impl FallbackProvider for SyntheticRetrieval {
    async fn fallback(&self, request: &StepRequest) -> anyhow::Result<serde_json::Value> {
        Ok(json!({
            "record_count": 3,
            "fields": ["age"],
            "source": request.input["data_source"],
        }))
    }
}

#[tokio::test]
async fn test_clean_run_completes_with_compliance() {
    init_test_logging();
    let harness = Harness::standard();
    let (system, _transport) = start_system(fast_config(), &harness);

    let input = PlanInput::new("q-clean", "researcher-1").with_steps(vec![
        StepSpec::new("validation", Role::Validation, json!({ "query": "cohort" })),
        StepSpec::new("consent_check:ehr", Role::ConsentCheck, json!({ "data_source": "ehr" })),
        StepSpec::new("data_retrieval:ehr", Role::DataRetrieval, json!({ "data_source": "ehr" })),
        StepSpec::new("anonymization", Role::Anonymization, json!({})),
    ]);
    let workflow_id = system.orchestrator().submit_workflow(input).expect("submitted");

    let report = system
        .orchestrator()
        .wait_for_completion(workflow_id, WAIT)
        .await
        .expect("known workflow");

    assert_eq!(report.status, WorkflowStatus::Completed);
    assert!(report.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert!(report.error_log.is_empty());

    let results = report.results.expect("completed workflows carry results");
    assert_eq!(results.processing_summary.total_steps, 4);
    assert_eq!(results.processing_summary.failed_steps, 0);
    assert_eq!(results.processing_summary.total_retries, 0);
    assert!(results.quality_assessment.compliance_passed);
    assert!(results.quality_assessment.approved);
    assert_eq!(results.step_outputs["data_retrieval:ehr"]["record_count"], 12);

    system.shutdown().await;
}

#[tokio::test]
async fn test_standard_plan_passes_earlier_outputs_forward() {
    let harness = Harness::standard();
    let (system, transport) = start_system(fast_config(), &harness);

    let input = PlanInput::new("q-standard", "researcher-1")
        .with_data_sources(["ehr", "registry"])
        .with_ethics_review()
        .with_reasoning();
    let workflow_id = system.orchestrator().submit_workflow(input).expect("submitted");
    let report = system
        .orchestrator()
        .wait_for_completion(workflow_id, WAIT)
        .await
        .expect("known workflow");

    assert_eq!(report.status, WorkflowStatus::Completed);
    let names: Vec<&str> = report.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        [
            "validation",
            "consent_check:ehr",
            "consent_check:registry",
            "ethics_review",
            "data_retrieval:ehr",
            "data_retrieval:registry",
            "anonymization",
            "knowledge_reasoning",
        ]
    );
    assert_eq!(harness.handler(Role::ConsentCheck).calls(), 2);
    assert_eq!(transport.sends_to(&Role::DataRetrieval.agent_id()), 2);

    let results = report.results.expect("results");
    let retrieval = &results.role_summaries[&Role::DataRetrieval];
    assert_eq!(retrieval.details["total_records"], 24);

    system.shutdown().await;
}

#[tokio::test]
async fn test_flaky_step_succeeds_after_retries() {
    let harness = Harness::standard().with(
        Role::ConsentCheck,
        ScriptedHandler::flaky(2, standard_output(Role::ConsentCheck)),
    );
    let (system, _transport) = start_system(fast_config(), &harness);

    let workflow_id = system
        .orchestrator()
        .submit_workflow(PlanInput::new("q-flaky", "researcher-1").with_data_sources(["ehr"]))
        .expect("submitted");
    let report = system
        .orchestrator()
        .wait_for_completion(workflow_id, WAIT)
        .await
        .expect("known workflow");

    assert_eq!(report.status, WorkflowStatus::Completed);
    let consent = report
        .steps
        .iter()
        .find(|s| s.role == Role::ConsentCheck)
        .expect("consent step");
    assert_eq!(consent.retry_count, 2);
    assert!(!consent.low_confidence);
    assert_eq!(report.total_retries, 2);

    let retried = system.orchestrator().get_audit_trail(
        &AuditFilter::for_workflow(workflow_id).with_event_type(AuditEventType::StepRetried),
    );
    assert_eq!(retried.len(), 2);

    system.shutdown().await;
}

#[tokio::test]
async fn test_permanent_failure_recovered_by_fallback() {
    let harness = Harness::standard().with(Role::DataRetrieval, ScriptedHandler::failing());
    let (system, _transport) = start_system(fast_config(), &harness);
    system
        .orchestrator()
        .register_fallback(Role::DataRetrieval, Arc::new(SyntheticRetrieval));

    let workflow_id = system
        .orchestrator()
        .submit_workflow(PlanInput::new("q-fallback", "researcher-1").with_data_sources(["ehr"]))
        .expect("submitted");
    let report = system
        .orchestrator()
        .wait_for_completion(workflow_id, WAIT)
        .await
        .expect("known workflow");

    assert_eq!(report.status, WorkflowStatus::Completed);
    // default policy: 3 retries after the first attempt
    assert_eq!(harness.handler(Role::DataRetrieval).calls(), 4);
    assert_eq!(report.low_confidence_steps, vec!["data_retrieval:ehr".to_string()]);

    let retrieval = report
        .steps
        .iter()
        .find(|s| s.name == "data_retrieval:ehr")
        .expect("retrieval step");
    assert!(retrieval.low_confidence);
    assert_eq!(retrieval.recovered_via, Some(RecoveryStrategy::Fallback));
    assert_eq!(report.error_log[0].code, "RETRY_EXHAUSTED");

    let recovered = system.orchestrator().get_audit_trail(
        &AuditFilter::for_workflow(workflow_id).with_event_type(AuditEventType::RecoverySuccess),
    );
    assert_eq!(recovered.len(), 1);

    let results = report.results.expect("results");
    assert_eq!(results.processing_summary.recovered_steps, 1);
    assert!(results
        .quality_assessment
        .recommendations
        .iter()
        .any(|r| r.contains("data_retrieval:ehr")));

    system.shutdown().await;
}

#[tokio::test]
async fn test_permanent_failure_without_recovery_fails_workflow() {
    let harness = Harness::standard().with(Role::DataRetrieval, ScriptedHandler::failing());
    let (system, _transport) = start_system(fast_config(), &harness);

    let workflow_id = system
        .orchestrator()
        .submit_workflow(PlanInput::new("q-unrecovered", "researcher-1").with_data_sources(["ehr"]))
        .expect("submitted");
    let report = system
        .orchestrator()
        .wait_for_completion(workflow_id, WAIT)
        .await
        .expect("known workflow");

    assert_eq!(report.status, WorkflowStatus::Failed);
    assert!(report.results.is_none());
    let failure = report
        .error_log
        .iter()
        .find(|entry| entry.code == "RECOVERY_FAILED")
        .expect("recovery failure logged");
    assert_eq!(failure.role, Some(Role::DataRetrieval));
    assert_eq!(failure.step.as_deref(), Some("data_retrieval:ehr"));

    // anonymization never ran
    assert_eq!(harness.handler(Role::Anonymization).calls(), 0);
    let anonymization = report
        .steps
        .iter()
        .find(|s| s.role == Role::Anonymization)
        .expect("anonymization step");
    assert_eq!(anonymization.status, StepStatus::Pending);

    system.shutdown().await;
}

#[tokio::test]
async fn test_open_breaker_rejects_without_transport_attempt() {
    let mut config = fast_config();
    config.circuit_breaker.failure_threshold = 5;
    config.orchestration.roles.insert(
        Role::EthicsReview,
        RolePolicyOverride {
            max_retries: Some(5),
            recovery: Some(RecoveryStrategy::Escalate),
            ..Default::default()
        },
    );
    let harness = Harness::standard().with(Role::EthicsReview, ScriptedHandler::failing());
    let (system, transport) = start_system(config, &harness);

    let input = PlanInput::new("q-breaker", "researcher-1").with_steps(vec![StepSpec::new(
        "ethics_review",
        Role::EthicsReview,
        json!({}),
    )]);
    let workflow_id = system.orchestrator().submit_workflow(input).expect("submitted");
    let report = system
        .orchestrator()
        .wait_for_completion(workflow_id, WAIT)
        .await
        .expect("known workflow");

    let agent = Role::EthicsReview.agent_id();
    assert_eq!(report.status, WorkflowStatus::Failed);
    assert_eq!(transport.sends_to(&agent), 5);
    assert_eq!(harness.handler(Role::EthicsReview).calls(), 5);
    assert_eq!(system.breakers().state(&agent), Some(CircuitState::Open));
    assert_eq!(report.steps[0].retry_count, 5);

    let audit = system
        .orchestrator()
        .get_audit_trail(&AuditFilter::for_workflow(workflow_id));
    let count = |kind: AuditEventType| audit.iter().filter(|e| e.event_type == kind).count();
    assert_eq!(count(AuditEventType::CircuitRejected), 1);
    assert_eq!(count(AuditEventType::StepFailed), 6);
    assert_eq!(count(AuditEventType::EscalationRaised), 1);
    assert_eq!(count(AuditEventType::WorkflowFailed), 1);

    system.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_workflow_fails_fast_on_open_breaker() {
    let mut config = fast_config();
    config.circuit_breaker.failure_threshold = 2;
    config.orchestration.roles.insert(
        Role::EthicsReview,
        RolePolicyOverride {
            max_retries: Some(1),
            recovery: Some(RecoveryStrategy::Escalate),
            ..Default::default()
        },
    );
    let harness = Harness::standard()
        .with(Role::EthicsReview, ScriptedHandler::failing())
        .with(
            Role::Validation,
            ScriptedHandler::slow(Duration::from_millis(400), standard_output(Role::Validation)),
        );
    let (system, transport) = start_system(config, &harness);
    let orchestrator = system.orchestrator();
    let agent = Role::EthicsReview.agent_id();

    let tripping = orchestrator
        .submit_workflow(PlanInput::new("q-trip", "researcher-1").with_steps(vec![
            StepSpec::new("ethics_review", Role::EthicsReview, json!({})),
        ]))
        .expect("submitted");
    // Still inside its slow validation step when the breaker opens
    let trailing = orchestrator
        .submit_workflow(PlanInput::new("q-trailing", "researcher-2").with_steps(vec![
            StepSpec::new("validation", Role::Validation, json!({})),
            StepSpec::new("ethics_review", Role::EthicsReview, json!({})),
        ]))
        .expect("submitted");

    let first = orchestrator
        .wait_for_completion(tripping, WAIT)
        .await
        .expect("known workflow");
    assert_eq!(first.status, WorkflowStatus::Failed);
    assert_eq!(system.breakers().state(&agent), Some(CircuitState::Open));
    let sends_after_trip = transport.sends_to(&agent);
    assert_eq!(sends_after_trip, 2);

    let second = orchestrator
        .wait_for_completion(trailing, WAIT)
        .await
        .expect("known workflow");
    assert_eq!(second.status, WorkflowStatus::Failed);
    assert_eq!(second.steps[0].status, StepStatus::Completed);
    assert_eq!(transport.sends_to(&agent), sends_after_trip);
    assert_eq!(harness.handler(Role::EthicsReview).calls(), 2);

    let audit = orchestrator.get_audit_trail(&AuditFilter::for_workflow(trailing));
    let ethics_failures: Vec<_> = audit
        .iter()
        .filter(|e| e.event_type == AuditEventType::StepFailed)
        .collect();
    assert_eq!(ethics_failures.len(), 2);
    assert!(ethics_failures
        .iter()
        .all(|e| e.details["code"] == "CIRCUIT_OPEN"));
    assert_eq!(
        audit
            .iter()
            .filter(|e| e.event_type == AuditEventType::CircuitRejected)
            .count(),
        2
    );

    system.shutdown().await;
}

#[tokio::test]
async fn test_submission_beyond_capacity_is_rejected() {
    let mut config = fast_config();
    config.orchestration.max_concurrent_workflows = 1;
    let harness = Harness::standard().with(
        Role::Validation,
        ScriptedHandler::slow(Duration::from_millis(300), standard_output(Role::Validation)),
    );
    let (system, _transport) = start_system(config, &harness);
    let orchestrator = system.orchestrator();

    let single_step = |query: &str| {
        PlanInput::new(query, "researcher-1").with_steps(vec![StepSpec::new(
            "validation",
            Role::Validation,
            json!({}),
        )])
    };

    let first = orchestrator.submit_workflow(single_step("q-1")).expect("first fits");
    let rejected = orchestrator.submit_workflow(single_step("q-2"));
    assert_eq!(
        rejected,
        Err(OrchestrationError::ConcurrencyLimitExceeded { limit: 1 })
    );

    let stats = orchestrator.get_orchestrator_stats();
    assert_eq!(stats.counters.rejected, 1);
    assert_eq!(stats.counters.submitted, 1);
    assert_eq!(stats.active_workflows, 1);

    let report = orchestrator
        .wait_for_completion(first, WAIT)
        .await
        .expect("known workflow");
    assert_eq!(report.status, WorkflowStatus::Completed);

    // the slot is released once the first workflow finishes
    assert!(orchestrator.submit_workflow(single_step("q-3")).is_ok());

    system.shutdown().await;
}
