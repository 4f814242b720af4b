//! # Workflow Plans
//!
//! Turns a [`PlanInput`] into the ordered step list a workflow executes. Steps run
//! strictly in plan order; each later step sees earlier outputs by step name.

use super::errors::{OrchestrationError, OrchestrationResult};
use crate::roles::Role;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};

/// One planned step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub input: serde_json::Value,
}

impl StepSpec {
    pub fn new(name: impl Into<String>, role: Role, input: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            role,
            input,
        }
    }
}

/// Submission request for a research data access workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanInput {
    pub query_id: String,
    pub owner_id: String,
    pub data_sources: Vec<String>,
    pub require_ethics_review: bool,
    pub include_reasoning: bool,
    pub parameters: serde_json::Value,
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Explicit steps; replaces the standard research plan when present
    pub steps: Option<Vec<StepSpec>>,
}

impl PlanInput {
    pub fn new(query_id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            owner_id: owner_id.into(),
            ..Default::default()
        }
    }

    pub fn with_data_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.data_sources = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ethics_review(mut self) -> Self {
        self.require_ethics_review = true;
        self
    }

    pub fn with_reasoning(mut self) -> Self {
        self.include_reasoning = true;
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_steps(mut self, steps: Vec<StepSpec>) -> Self {
        self.steps = Some(steps);
        self
    }
}

/// Build and validate the step list for `input`
pub fn build_plan(input: &PlanInput) -> OrchestrationResult<Vec<StepSpec>> {
    if input.query_id.trim().is_empty() {
        return Err(OrchestrationError::invalid_plan("query_id must not be empty"));
    }
    if input.owner_id.trim().is_empty() {
        return Err(OrchestrationError::invalid_plan("owner_id must not be empty"));
    }

    let steps = match &input.steps {
        Some(steps) => steps.clone(),
        None => standard_plan(input)?,
    };
    if steps.is_empty() {
        return Err(OrchestrationError::invalid_plan("plan has no steps"));
    }

    let mut names = HashSet::new();
    for step in &steps {
        if step.name.trim().is_empty() {
            return Err(OrchestrationError::invalid_plan("step names must not be empty"));
        }
        if !names.insert(step.name.as_str()) {
            return Err(OrchestrationError::invalid_plan(format!(
                "duplicate step name {}",
                step.name
            )));
        }
    }
    Ok(steps)
}

/// validation → consent per source → ethics review? → retrieval per source →
/// anonymization → reasoning?
fn standard_plan(input: &PlanInput) -> OrchestrationResult<Vec<StepSpec>> {
    if input.data_sources.is_empty() {
        return Err(OrchestrationError::invalid_plan(
            "retrieval plans require at least one data source",
        ));
    }

    let mut steps = vec![StepSpec::new(
        "validation",
        Role::Validation,
        json!({
            "query_id": input.query_id,
            "parameters": input.parameters,
            "data_sources": input.data_sources,
        }),
    )];

    for source in &input.data_sources {
        steps.push(StepSpec::new(
            format!("consent_check:{source}"),
            Role::ConsentCheck,
            json!({ "data_source": source, "owner_id": input.owner_id }),
        ));
    }

    if input.require_ethics_review {
        steps.push(StepSpec::new(
            "ethics_review",
            Role::EthicsReview,
            json!({ "query_id": input.query_id, "parameters": input.parameters }),
        ));
    }

    for source in &input.data_sources {
        steps.push(StepSpec::new(
            format!("data_retrieval:{source}"),
            Role::DataRetrieval,
            json!({ "data_source": source, "parameters": input.parameters }),
        ));
    }

    steps.push(StepSpec::new(
        "anonymization",
        Role::Anonymization,
        json!({ "query_id": input.query_id }),
    ));

    if input.include_reasoning {
        steps.push(StepSpec::new(
            "knowledge_reasoning",
            Role::KnowledgeReasoning,
            json!({ "query_id": input.query_id, "parameters": input.parameters }),
        ));
    }

    Ok(steps)
}
