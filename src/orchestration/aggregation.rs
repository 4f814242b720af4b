//! # Result Aggregation
//!
//! Folds the outputs of a finished workflow into per-role summaries, one weighted
//! quality score and a compliance verdict.
//!
//! ## Scoring
//!
//! Each completed step scores in `[0, 1]` from its role's output (approval flags,
//! self-reported quality or confidence). Outputs produced by recovery are scaled by
//! `1 - low_confidence_penalty`. A role's sub-score is the mean over its steps; the
//! overall score is the weight-normalised mean over the roles present.
//!
//! ## Compliance
//!
//! Every registered [`CompliancePredicate`] must pass for the workflow to be
//! approved. Recommendations list each sub-score below the quality threshold and
//! each failed predicate.

use super::types::{StepStatus, WorkflowExecution};
use crate::config::OrchestrationConfig;
use crate::roles::Role;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingSummary {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub recovered_steps: usize,
    pub total_retries: u32,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleSummary {
    pub steps: usize,
    pub completed: usize,
    pub low_confidence: usize,
    pub score: f64,
    /// Share of steps whose approval flag was set, for roles that report one
    pub approval_rate: Option<f64>,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub overall_score: f64,
    pub role_scores: BTreeMap<Role, f64>,
    pub predicate_results: BTreeMap<String, bool>,
    pub compliance_passed: bool,
    pub approved: bool,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResults {
    pub processing_summary: ProcessingSummary,
    pub role_summaries: BTreeMap<Role, RoleSummary>,
    pub quality_assessment: QualityAssessment,
    pub step_outputs: BTreeMap<String, serde_json::Value>,
}

/// Inputs visible to compliance predicates
#[derive(Debug, Clone, Copy)]
pub struct ComplianceContext<'a> {
    pub summaries: &'a BTreeMap<Role, RoleSummary>,
    pub overall_score: f64,
}

/// Independent gate on whether a workflow's artifact may be approved
pub trait CompliancePredicate: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn evaluate(&self, context: &ComplianceContext<'_>) -> bool;
}

/// Every step of `role` must have set its approval flag; vacuously true when the role did not run
#[derive(Debug, Clone)]
pub struct RoleApprovalPredicate {
    name: String,
    role: Role,
}

impl RoleApprovalPredicate {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
        }
    }
}

impl CompliancePredicate for RoleApprovalPredicate {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, context: &ComplianceContext<'_>) -> bool {
        match context.summaries.get(&self.role) {
            Some(summary) => summary.approval_rate.map_or(true, |rate| rate >= 1.0),
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MinimumQualityPredicate {
    threshold: f64,
}

impl MinimumQualityPredicate {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl CompliancePredicate for MinimumQualityPredicate {
    fn name(&self) -> &str {
        "minimum_quality"
    }

    fn evaluate(&self, context: &ComplianceContext<'_>) -> bool {
        context.overall_score >= self.threshold
    }
}

#[derive(Debug)]
pub struct ResultAggregator {
    weights: BTreeMap<Role, f64>,
    quality_threshold: f64,
    low_confidence_penalty: f64,
    predicates: RwLock<Vec<Arc<dyn CompliancePredicate>>>,
}

impl ResultAggregator {
    /// Aggregator with the standard predicate set
    pub fn new(config: &OrchestrationConfig) -> Self {
        let predicates: Vec<Arc<dyn CompliancePredicate>> = vec![
            Arc::new(RoleApprovalPredicate::new("input_validated", Role::Validation)),
            Arc::new(RoleApprovalPredicate::new("consent_granted", Role::ConsentCheck)),
            Arc::new(RoleApprovalPredicate::new("ethics_approved", Role::EthicsReview)),
            Arc::new(RoleApprovalPredicate::new("data_anonymized", Role::Anonymization)),
            Arc::new(MinimumQualityPredicate::new(config.quality_threshold)),
        ];

        Self {
            weights: Role::ALL
                .into_iter()
                .map(|role| (role, config.role_policy(role).weight))
                .collect(),
            quality_threshold: config.quality_threshold,
            low_confidence_penalty: config.low_confidence_penalty,
            predicates: RwLock::new(predicates),
        }
    }

    pub fn add_predicate(&self, predicate: Arc<dyn CompliancePredicate>) {
        self.predicates.write().push(predicate);
    }

    pub fn predicate_names(&self) -> Vec<String> {
        self.predicates
            .read()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    pub fn aggregate(&self, execution: &WorkflowExecution) -> AggregatedResults {
        let role_summaries = self.summarize_roles(execution);
        let role_scores: BTreeMap<Role, f64> = role_summaries
            .iter()
            .map(|(role, summary)| (*role, summary.score))
            .collect();
        let overall_score = self.overall_score(&role_scores);

        let context = ComplianceContext {
            summaries: &role_summaries,
            overall_score,
        };
        let predicate_results: BTreeMap<String, bool> = self
            .predicates
            .read()
            .iter()
            .map(|p| (p.name().to_string(), p.evaluate(&context)))
            .collect();
        let compliance_passed = predicate_results.values().all(|passed| *passed);

        let mut recommendations: Vec<String> = role_scores
            .iter()
            .filter(|(_, score)| **score < self.quality_threshold)
            .map(|(role, score)| {
                format!(
                    "{role} score {score:.2} is below the {:.2} threshold",
                    self.quality_threshold
                )
            })
            .collect();
        recommendations.extend(
            predicate_results
                .iter()
                .filter(|(_, passed)| !**passed)
                .map(|(name, _)| format!("compliance check {name} failed")),
        );
        recommendations.extend(execution.steps.iter().filter(|s| s.low_confidence).map(|s| {
            format!(
                "step {} used a recovered low-confidence output; verify before relying on it",
                s.name
            )
        }));

        AggregatedResults {
            processing_summary: processing_summary(execution),
            role_summaries,
            quality_assessment: QualityAssessment {
                overall_score,
                role_scores,
                predicate_results,
                compliance_passed,
                approved: compliance_passed,
                recommendations,
            },
            step_outputs: execution.step_context(),
        }
    }

    fn summarize_roles(&self, execution: &WorkflowExecution) -> BTreeMap<Role, RoleSummary> {
        let mut summaries = BTreeMap::new();

        for role in Role::ALL {
            let steps: Vec<_> = execution.steps.iter().filter(|s| s.role == role).collect();
            if steps.is_empty() {
                continue;
            }

            let outputs: Vec<&serde_json::Value> = steps
                .iter()
                .filter(|s| s.is_completed())
                .filter_map(|s| s.output.as_ref())
                .collect();

            let total: f64 = steps
                .iter()
                .map(|step| match (&step.output, step.is_completed()) {
                    (Some(output), true) => {
                        let score = step_score(role, output);
                        if step.low_confidence {
                            score * (1.0 - self.low_confidence_penalty)
                        } else {
                            score
                        }
                    }
                    _ => 0.0,
                })
                .sum();

            let approval_rate = approval_flag(role).map(|flag| {
                let approved = outputs
                    .iter()
                    .filter(|o| o.get(flag).and_then(serde_json::Value::as_bool) == Some(true))
                    .count();
                approved as f64 / steps.len() as f64
            });

            summaries.insert(
                role,
                RoleSummary {
                    steps: steps.len(),
                    completed: outputs.len(),
                    low_confidence: steps.iter().filter(|s| s.low_confidence).count(),
                    score: total / steps.len() as f64,
                    approval_rate,
                    details: role_details(role, &outputs),
                },
            );
        }
        summaries
    }

    fn overall_score(&self, role_scores: &BTreeMap<Role, f64>) -> f64 {
        let (weighted, total_weight) =
            role_scores
                .iter()
                .fold((0.0, 0.0), |(sum, total), (role, score)| {
                    let weight = self.weights.get(role).copied().unwrap_or(0.0);
                    (sum + weight * score, total + weight)
                });
        if total_weight > 0.0 {
            weighted / total_weight
        } else {
            0.0
        }
    }
}

fn processing_summary(execution: &WorkflowExecution) -> ProcessingSummary {
    ProcessingSummary {
        total_steps: execution.steps.len(),
        completed_steps: execution.steps.iter().filter(|s| s.is_completed()).count(),
        failed_steps: execution
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .count(),
        recovered_steps: execution.steps.iter().filter(|s| s.low_confidence).count(),
        total_retries: execution.total_retries(),
        duration_ms: execution
            .started_at
            .map(|started| (Utc::now() - started).num_milliseconds().max(0) as u64),
    }
}

fn approval_flag(role: Role) -> Option<&'static str> {
    match role {
        Role::Validation => Some("valid"),
        Role::ConsentCheck => Some("consent_granted"),
        Role::EthicsReview => Some("approved"),
        Role::Anonymization => Some("anonymized"),
        Role::DataRetrieval | Role::KnowledgeReasoning => None,
    }
}

fn unit_number(output: &serde_json::Value, field: &str) -> f64 {
    output
        .get(field)
        .and_then(serde_json::Value::as_f64)
        .map_or(0.0, |v| v.clamp(0.0, 1.0))
}

fn flag(output: &serde_json::Value, field: &str) -> f64 {
    match output.get(field).and_then(serde_json::Value::as_bool) {
        Some(true) => 1.0,
        _ => 0.0,
    }
}

fn step_score(role: Role, output: &serde_json::Value) -> f64 {
    match role {
        Role::Validation => flag(output, "valid"),
        Role::ConsentCheck => flag(output, "consent_granted"),
        Role::EthicsReview => unit_number(output, "ethics_score"),
        Role::DataRetrieval => {
            let records = output
                .get("record_count")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0);
            if records > 0 {
                1.0
            } else {
                0.0
            }
        }
        Role::Anonymization => unit_number(output, "quality_score"),
        Role::KnowledgeReasoning => unit_number(output, "confidence"),
    }
}

fn role_details(role: Role, outputs: &[&serde_json::Value]) -> serde_json::Value {
    match role {
        Role::DataRetrieval => {
            let total_records: u64 = outputs
                .iter()
                .filter_map(|o| o.get("record_count").and_then(serde_json::Value::as_u64))
                .sum();
            let fields: BTreeSet<&str> = outputs
                .iter()
                .filter_map(|o| o.get("fields").and_then(serde_json::Value::as_array))
                .flatten()
                .filter_map(serde_json::Value::as_str)
                .collect();
            serde_json::json!({ "total_records": total_records, "fields": fields })
        }
        Role::KnowledgeReasoning => {
            let insight_count: usize = outputs
                .iter()
                .filter_map(|o| o.get("insights").and_then(serde_json::Value::as_array))
                .map(Vec::len)
                .sum();
            serde_json::json!({ "insight_count": insight_count })
        }
        _ => serde_json::json!({}),
    }
}
