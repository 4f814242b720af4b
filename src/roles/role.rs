//! # Roles
//!
//! The closed set of step handler categories a workflow can target. Each role
//! carries its output contract, retry/recovery policy and compensation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Validation,
    ConsentCheck,
    EthicsReview,
    DataRetrieval,
    Anonymization,
    KnowledgeReasoning,
}

/// What to do once a step has spent its retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Ask the registered fallback provider for a substitute output
    Fallback,
    /// Reuse the last successful output for an identical input
    CachedResult,
    /// Raise an escalation and fail the workflow
    Escalate,
    None,
}

/// Execution policy for steps targeting one role
#[derive(Debug, Clone, PartialEq)]
pub struct RolePolicy {
    pub max_retries: u32,
    pub backoff_factor: f64,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Per-attempt timeout; zero means "use the orchestration default"
    pub timeout: Duration,
    pub recovery: RecoveryStrategy,
    /// Weight of this role's sub-score in the overall quality score
    pub weight: f64,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Validation,
        Role::ConsentCheck,
        Role::EthicsReview,
        Role::DataRetrieval,
        Role::Anonymization,
        Role::KnowledgeReasoning,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Validation => "validation",
            Role::ConsentCheck => "consent_check",
            Role::EthicsReview => "ethics_review",
            Role::DataRetrieval => "data_retrieval",
            Role::Anonymization => "anonymization",
            Role::KnowledgeReasoning => "knowledge_reasoning",
        }
    }

    /// Recipient id used for messages addressed to this role
    pub fn agent_id(self) -> String {
        format!("{}_agent", self.as_str())
    }

    pub fn from_agent_id(agent_id: &str) -> Option<Role> {
        let name = agent_id.strip_suffix("_agent")?;
        Role::ALL.into_iter().find(|role| role.as_str() == name)
    }

    /// Fields every successful output must carry
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            Role::Validation => &["valid"],
            Role::ConsentCheck => &["consent_granted"],
            Role::EthicsReview => &["approved", "ethics_score"],
            Role::DataRetrieval => &["record_count", "fields"],
            Role::Anonymization => &["anonymized", "quality_score"],
            Role::KnowledgeReasoning => &["insights", "confidence"],
        }
    }

    /// Fields from `output` this role requires but which are missing
    pub fn missing_fields(self, output: &serde_json::Value) -> Vec<&'static str> {
        self.required_fields()
            .iter()
            .copied()
            .filter(|field| output.get(field).map_or(true, serde_json::Value::is_null))
            .collect()
    }

    /// Undo action registered once a step of this role commits
    pub fn compensation_action(self) -> Option<&'static str> {
        match self {
            Role::ConsentCheck => Some("release_consent_hold"),
            Role::DataRetrieval => Some("discard_retrieved_records"),
            Role::Anonymization => Some("purge_anonymized_dataset"),
            Role::Validation | Role::EthicsReview | Role::KnowledgeReasoning => None,
        }
    }

    pub fn default_policy(self) -> RolePolicy {
        let (max_retries, recovery, weight) = match self {
            Role::Validation => (2, RecoveryStrategy::Escalate, 0.15),
            Role::ConsentCheck => (3, RecoveryStrategy::CachedResult, 0.25),
            Role::EthicsReview => (2, RecoveryStrategy::Escalate, 0.2),
            Role::DataRetrieval => (3, RecoveryStrategy::Fallback, 0.15),
            Role::Anonymization => (2, RecoveryStrategy::Fallback, 0.25),
            Role::KnowledgeReasoning => (1, RecoveryStrategy::Fallback, 0.1),
        };

        RolePolicy {
            max_retries,
            backoff_factor: 2.0,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            timeout: Duration::ZERO,
            recovery,
            weight,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
