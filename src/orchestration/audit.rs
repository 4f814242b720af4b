//! # Audit Trail
//!
//! Bounded, append-only log of workflow lifecycle transitions. When the trail grows
//! past `max_events` it is trimmed to the newest `trim_to` records.

use super::types::WorkflowRef;
use crate::config::AuditConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    WorkflowSubmitted,
    WorkflowStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepRetried,
    CircuitRejected,
    RecoveryAttempted,
    RecoverySuccess,
    RecoveryFailed,
    EscalationRaised,
    CompensationExecuted,
    CompensationFailed,
    CancelRequested,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
}

impl AuditEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowSubmitted => "WORKFLOW_SUBMITTED",
            Self::WorkflowStarted => "WORKFLOW_STARTED",
            Self::StepStarted => "STEP_STARTED",
            Self::StepCompleted => "STEP_COMPLETED",
            Self::StepFailed => "STEP_FAILED",
            Self::StepRetried => "STEP_RETRIED",
            Self::CircuitRejected => "CIRCUIT_REJECTED",
            Self::RecoveryAttempted => "RECOVERY_ATTEMPTED",
            Self::RecoverySuccess => "RECOVERY_SUCCESS",
            Self::RecoveryFailed => "RECOVERY_FAILED",
            Self::EscalationRaised => "ESCALATION_RAISED",
            Self::CompensationExecuted => "COMPENSATION_EXECUTED",
            Self::CompensationFailed => "COMPENSATION_FAILED",
            Self::CancelRequested => "CANCEL_REQUESTED",
            Self::WorkflowCompleted => "WORKFLOW_COMPLETED",
            Self::WorkflowFailed => "WORKFLOW_FAILED",
            Self::WorkflowCancelled => "WORKFLOW_CANCELLED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub workflow_id: Uuid,
    pub query_id: String,
    pub owner_id: String,
    pub event_type: AuditEventType,
    pub details: serde_json::Value,
}

/// Filters for [`AuditTrail::query`]; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub workflow_id: Option<Uuid>,
    pub event_type: Option<AuditEventType>,
    /// Keep only the newest `limit` matches
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn for_workflow(workflow_id: Uuid) -> Self {
        Self {
            workflow_id: Some(workflow_id),
            ..Default::default()
        }
    }

    pub fn with_event_type(mut self, event_type: AuditEventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, event: &AuditEvent) -> bool {
        self.workflow_id.map_or(true, |id| event.workflow_id == id)
            && self.event_type.map_or(true, |t| event.event_type == t)
    }
}

#[derive(Debug)]
pub struct AuditTrail {
    config: AuditConfig,
    events: Mutex<VecDeque<AuditEvent>>,
}

impl AuditTrail {
    pub fn new(config: AuditConfig) -> Self {
        Self {
            config,
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn record(
        &self,
        workflow: &WorkflowRef,
        event_type: AuditEventType,
        details: serde_json::Value,
    ) {
        if !self.config.enabled {
            return;
        }

        let event = AuditEvent {
            timestamp: Utc::now(),
            workflow_id: workflow.workflow_id,
            query_id: workflow.query_id.clone(),
            owner_id: workflow.owner_id.clone(),
            event_type,
            details,
        };

        let mut events = self.events.lock();
        events.push_back(event);
        if events.len() > self.config.max_events {
            let excess = events.len().saturating_sub(self.config.trim_to);
            events.drain(..excess);
            debug!(kept = events.len(), "Audit trail trimmed");
        }
    }

    /// Matching events, oldest first
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        let events = self.events.lock();
        let mut matched: Vec<AuditEvent> = events
            .iter()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workflow() -> WorkflowRef {
        WorkflowRef {
            workflow_id: Uuid::new_v4(),
            query_id: "q-1".into(),
            owner_id: "researcher".into(),
        }
    }

    fn trail(max_events: usize, trim_to: usize) -> AuditTrail {
        AuditTrail::new(AuditConfig {
            enabled: true,
            max_events,
            trim_to,
        })
    }

    #[test]
    fn test_trims_to_newest_on_overflow() {
        let trail = trail(10, 5);
        let wf = workflow();
        for i in 0..11 {
            trail.record(&wf, AuditEventType::StepStarted, json!({ "n": i }));
        }

        let events = trail.query(&AuditFilter::default());
        assert_eq!(events.len(), 5);
        assert_eq!(events[0].details["n"], 6);
        assert_eq!(events[4].details["n"], 10);
    }

    #[test]
    fn test_filters_by_workflow_and_type() {
        let trail = trail(100, 50);
        let first = workflow();
        let second = workflow();
        trail.record(&first, AuditEventType::WorkflowStarted, json!({}));
        trail.record(&first, AuditEventType::StepFailed, json!({}));
        trail.record(&second, AuditEventType::StepFailed, json!({}));

        let failures = trail.query(
            &AuditFilter::for_workflow(first.workflow_id).with_event_type(AuditEventType::StepFailed),
        );
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].owner_id, "researcher");

        let newest = trail.query(&AuditFilter::default().with_limit(1));
        assert_eq!(newest[0].workflow_id, second.workflow_id);
    }

    #[test]
    fn test_disabled_trail_records_nothing() {
        let trail = AuditTrail::new(AuditConfig {
            enabled: false,
            ..Default::default()
        });
        trail.record(&workflow(), AuditEventType::WorkflowSubmitted, json!({}));
        assert!(trail.is_empty());
    }

    #[test]
    fn test_event_type_wire_names() {
        let json = serde_json::to_value(AuditEventType::RecoverySuccess).expect("serialize");
        assert_eq!(json, AuditEventType::RecoverySuccess.as_str());
    }
}
