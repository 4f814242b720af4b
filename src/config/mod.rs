//! # Relay Configuration System
//!
//! Layered, validated configuration for the delivery service, circuit breakers,
//! communication managers and the workflow orchestrator.
//!
//! ## Architecture
//!
//! - **Defaults first**: every section implements `Default` from [`crate::constants`]
//! - **Layered overrides**: optional config file, then `RELAY__SECTION__KEY` environment variables
//! - **Explicit validation**: invalid values are rejected, never silently corrected
//!
//! ## Usage
//!
//! ```rust,no_run
//! use research_relay::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load(Some("config/relay.toml"))?;
//! let max_workflows = manager.config().orchestration.max_concurrent_workflows;
//! let ack_timeout = manager.config().delivery.ack_timeout();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::constants;
use crate::resilience;
use crate::roles::{RecoveryStrategy, Role, RolePolicy};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Deployment environment name (development, test, production)
    pub environment: String,
    pub logging: LoggingConfig,
    pub delivery: DeliveryConfig,
    pub circuit_breaker: CircuitBreakerSettings,
    pub communication: CommunicationConfig,
    pub orchestration: OrchestrationConfig,
    pub audit: AuditConfig,
}

impl RelayConfig {
    /// Validate every section, returning the first violation found
    pub fn validate(&self) -> ConfigResult<()> {
        self.delivery.validate()?;
        self.circuit_breaker.validate()?;
        self.communication.validate()?;
        self.orchestration.validate()?;
        self.audit.validate()?;
        Ok(())
    }
}

/// Structured logging configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Explicit filter directive; falls back to an environment-derived level when absent
    pub level: Option<String>,
    /// Emit JSON records instead of human-readable lines
    pub json: bool,
}

/// Message delivery service configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub poll_interval_ms: u64,
    pub ack_timeout_ms: u64,
    pub stale_pending_timeout_secs: u64,
    pub cleanup_interval_ms: u64,
    pub default_max_retries: u32,
    pub backoff_factor: f64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_enabled: bool,
    pub jitter_max_percentage: f64,
    pub dead_letter_capacity: usize,
    pub latency_smoothing: f64,
}

impl DeliveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn stale_pending_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_pending_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "delivery.poll_interval_ms",
                self.poll_interval_ms,
                "must be greater than 0",
            ));
        }
        if self.ack_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "delivery.ack_timeout_ms",
                self.ack_timeout_ms,
                "must be greater than 0",
            ));
        }
        if self.cleanup_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "delivery.cleanup_interval_ms",
                self.cleanup_interval_ms,
                "must be greater than 0",
            ));
        }
        if self.backoff_factor < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "delivery.backoff_factor",
                self.backoff_factor,
                "must be at least 1.0",
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigurationError::invalid_value(
                "delivery.max_delay_ms",
                self.max_delay_ms,
                "must not be smaller than base_delay_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_max_percentage) {
            return Err(ConfigurationError::invalid_value(
                "delivery.jitter_max_percentage",
                self.jitter_max_percentage,
                "must be within [0, 1]",
            ));
        }
        if self.dead_letter_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "delivery.dead_letter_capacity",
                self.dead_letter_capacity,
                "must be greater than 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.latency_smoothing) || self.latency_smoothing == 0.0 {
            return Err(ConfigurationError::invalid_value(
                "delivery.latency_smoothing",
                self.latency_smoothing,
                "must be within (0, 1]",
            ));
        }
        Ok(())
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        use constants::delivery::*;
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            stale_pending_timeout_secs: DEFAULT_STALE_PENDING_TIMEOUT_SECS,
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
            default_max_retries: DEFAULT_MAX_RETRIES,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_enabled: true,
            jitter_max_percentage: DEFAULT_JITTER_MAX_PERCENTAGE,
            dead_letter_capacity: DEFAULT_DEAD_LETTER_CAPACITY,
            latency_smoothing: DEFAULT_LATENCY_SMOOTHING,
        }
    }
}

/// System-wide circuit breaker settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    /// Upper bound on tracked breakers. A new recipient beyond it replaces a
    /// closed breaker, or gets an untracked one when every breaker is tripped.
    pub max_circuit_breakers: usize,
    /// Per-recipient overrides keyed by recipient id
    pub recipient_overrides: HashMap<String, CircuitBreakerOverride>,
}

/// Override for a single recipient's breaker
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CircuitBreakerOverride {
    pub failure_threshold: Option<u32>,
    pub recovery_timeout_secs: Option<u64>,
}

impl CircuitBreakerSettings {
    /// Resolve the breaker configuration for a recipient
    pub fn config_for_recipient(&self, recipient: &str) -> resilience::CircuitBreakerConfig {
        let override_config = self.recipient_overrides.get(recipient);
        resilience::CircuitBreakerConfig {
            failure_threshold: override_config
                .and_then(|o| o.failure_threshold)
                .unwrap_or(self.failure_threshold),
            recovery_timeout: Duration::from_secs(
                override_config
                    .and_then(|o| o.recovery_timeout_secs)
                    .unwrap_or(self.recovery_timeout_secs),
            ),
        }
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigurationError::invalid_value(
                "circuit_breaker.failure_threshold",
                self.failure_threshold,
                "must be greater than 0",
            ));
        }
        if self.max_circuit_breakers == 0 {
            return Err(ConfigurationError::invalid_value(
                "circuit_breaker.max_circuit_breakers",
                self.max_circuit_breakers,
                "must be greater than 0",
            ));
        }
        for (recipient, override_config) in &self.recipient_overrides {
            if override_config.failure_threshold == Some(0) {
                return Err(ConfigurationError::invalid_value(
                    format!("circuit_breaker.recipient_overrides.{recipient}.failure_threshold"),
                    0,
                    "must be greater than 0",
                ));
            }
        }
        Ok(())
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        use constants::resilience::*;
        Self {
            enabled: true,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout_secs: DEFAULT_RECOVERY_TIMEOUT_SECS,
            max_circuit_breakers: DEFAULT_MAX_CIRCUIT_BREAKERS,
            recipient_overrides: HashMap::new(),
        }
    }
}

/// Communication manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CommunicationConfig {
    pub default_request_timeout_ms: u64,
    pub max_payload_bytes: usize,
}

impl CommunicationConfig {
    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.default_request_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "communication.default_request_timeout_ms",
                self.default_request_timeout_ms,
                "must be greater than 0",
            ));
        }
        if self.max_payload_bytes == 0 {
            return Err(ConfigurationError::invalid_value(
                "communication.max_payload_bytes",
                self.max_payload_bytes,
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Default for CommunicationConfig {
    fn default() -> Self {
        Self {
            default_request_timeout_ms: constants::communication::DEFAULT_REQUEST_TIMEOUT_MS,
            max_payload_bytes: constants::communication::DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

/// Workflow orchestrator configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    pub max_concurrent_workflows: usize,
    pub workflow_timeout_secs: u64,
    pub default_step_timeout_ms: u64,
    pub default_base_delay_ms: u64,
    pub default_max_delay_ms: u64,
    pub quality_threshold: f64,
    pub low_confidence_penalty: f64,
    pub metrics_smoothing: f64,
    /// Finished workflows retained in history; the oldest are dropped beyond this
    pub history_capacity: usize,
    /// Entries kept for `CachedResult` recovery; the oldest are evicted beyond this
    pub recovery_cache_capacity: usize,
    /// Requesters allowed to cancel workflows they do not own
    pub admin_requesters: Vec<String>,
    /// Per-role policy overrides
    pub roles: BTreeMap<Role, RolePolicyOverride>,
}

/// Partial policy applied on top of a role's defaults
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RolePolicyOverride {
    pub max_retries: Option<u32>,
    pub backoff_factor: Option<f64>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub recovery: Option<RecoveryStrategy>,
    pub weight: Option<f64>,
}

impl OrchestrationConfig {
    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.workflow_timeout_secs)
    }

    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_millis(self.default_step_timeout_ms)
    }

    /// Effective policy for a role: role defaults, orchestration defaults, then overrides
    pub fn role_policy(&self, role: Role) -> RolePolicy {
        let mut policy = role.default_policy();
        policy.base_delay = Duration::from_millis(self.default_base_delay_ms);
        policy.max_delay = Duration::from_millis(self.default_max_delay_ms);
        if policy.timeout.is_zero() {
            policy.timeout = self.default_step_timeout();
        }

        if let Some(o) = self.roles.get(&role) {
            if let Some(v) = o.max_retries {
                policy.max_retries = v;
            }
            if let Some(v) = o.backoff_factor {
                policy.backoff_factor = v;
            }
            if let Some(v) = o.base_delay_ms {
                policy.base_delay = Duration::from_millis(v);
            }
            if let Some(v) = o.max_delay_ms {
                policy.max_delay = Duration::from_millis(v);
            }
            if let Some(v) = o.timeout_ms {
                policy.timeout = Duration::from_millis(v);
            }
            if let Some(v) = o.recovery {
                policy.recovery = v;
            }
            if let Some(v) = o.weight {
                policy.weight = v;
            }
        }
        policy
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent_workflows == 0 {
            return Err(ConfigurationError::invalid_value(
                "orchestration.max_concurrent_workflows",
                self.max_concurrent_workflows,
                "must be greater than 0",
            ));
        }
        if self.workflow_timeout_secs == 0 {
            return Err(ConfigurationError::invalid_value(
                "orchestration.workflow_timeout_secs",
                self.workflow_timeout_secs,
                "must be greater than 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(ConfigurationError::invalid_value(
                "orchestration.quality_threshold",
                self.quality_threshold,
                "must be within [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.low_confidence_penalty) {
            return Err(ConfigurationError::invalid_value(
                "orchestration.low_confidence_penalty",
                self.low_confidence_penalty,
                "must be within [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.metrics_smoothing) || self.metrics_smoothing == 0.0 {
            return Err(ConfigurationError::invalid_value(
                "orchestration.metrics_smoothing",
                self.metrics_smoothing,
                "must be within (0, 1]",
            ));
        }
        if self.history_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "orchestration.history_capacity",
                self.history_capacity,
                "must be greater than 0",
            ));
        }
        if self.recovery_cache_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "orchestration.recovery_cache_capacity",
                self.recovery_cache_capacity,
                "must be greater than 0",
            ));
        }
        for role in Role::ALL {
            let policy = self.role_policy(role);
            if policy.backoff_factor < 1.0 {
                return Err(ConfigurationError::invalid_value(
                    format!("orchestration.roles.{role}.backoff_factor"),
                    policy.backoff_factor,
                    "must be at least 1.0",
                ));
            }
            if policy.timeout.is_zero() {
                return Err(ConfigurationError::invalid_value(
                    format!("orchestration.roles.{role}.timeout_ms"),
                    0,
                    "must be greater than 0",
                ));
            }
            if policy.weight < 0.0 {
                return Err(ConfigurationError::invalid_value(
                    format!("orchestration.roles.{role}.weight"),
                    policy.weight,
                    "must not be negative",
                ));
            }
        }
        Ok(())
    }
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        use constants::orchestration::*;
        Self {
            max_concurrent_workflows: DEFAULT_MAX_CONCURRENT_WORKFLOWS,
            workflow_timeout_secs: DEFAULT_WORKFLOW_TIMEOUT_SECS,
            default_step_timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            default_base_delay_ms: constants::delivery::DEFAULT_BASE_DELAY_MS,
            default_max_delay_ms: 30_000,
            quality_threshold: DEFAULT_QUALITY_THRESHOLD,
            low_confidence_penalty: DEFAULT_LOW_CONFIDENCE_PENALTY,
            metrics_smoothing: DEFAULT_METRICS_SMOOTHING,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            recovery_cache_capacity: DEFAULT_RECOVERY_CACHE_CAPACITY,
            admin_requesters: Vec::new(),
            roles: BTreeMap::new(),
        }
    }
}

/// Audit trail configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    /// Size at which the trail is trimmed
    pub max_events: usize,
    /// Number of newest events kept after trimming
    pub trim_to: usize,
}

impl AuditConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.max_events == 0 {
            return Err(ConfigurationError::invalid_value(
                "audit.max_events",
                self.max_events,
                "must be greater than 0",
            ));
        }
        if self.trim_to >= self.max_events {
            return Err(ConfigurationError::invalid_value(
                "audit.trim_to",
                self.trim_to,
                "must be smaller than max_events",
            ));
        }
        Ok(())
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_events: constants::audit::DEFAULT_MAX_EVENTS,
            trim_to: constants::audit::DEFAULT_TRIM_TO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.delivery.dead_letter_capacity, 1000);
        assert_eq!(config.delivery.stale_pending_timeout(), Duration::from_secs(600));
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.audit.max_events, 10_000);
        assert_eq!(config.audit.trim_to, 5_000);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = RelayConfig::default();
        config.audit.trim_to = config.audit.max_events;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.delivery.backoff_factor = 0.5;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.orchestration.max_concurrent_workflows = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.orchestration.history_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.orchestration.recovery_cache_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.orchestration.roles.insert(
            Role::ConsentCheck,
            RolePolicyOverride {
                backoff_factor: Some(0.2),
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_role_policy_overrides_apply_on_top_of_defaults() {
        let mut config = OrchestrationConfig {
            default_base_delay_ms: 5,
            ..Default::default()
        };
        config.roles.insert(
            Role::DataRetrieval,
            RolePolicyOverride {
                max_retries: Some(7),
                recovery: Some(RecoveryStrategy::Escalate),
                ..Default::default()
            },
        );

        let policy = config.role_policy(Role::DataRetrieval);
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.recovery, RecoveryStrategy::Escalate);
        assert_eq!(policy.base_delay, Duration::from_millis(5));

        let untouched = config.role_policy(Role::Validation);
        assert_eq!(untouched.max_retries, Role::Validation.default_policy().max_retries);
    }

    #[test]
    fn test_breaker_recipient_override() {
        let mut settings = CircuitBreakerSettings::default();
        settings.recipient_overrides.insert(
            "ethics_review_agent".to_string(),
            CircuitBreakerOverride {
                failure_threshold: Some(2),
                recovery_timeout_secs: None,
            },
        );

        let overridden = settings.config_for_recipient("ethics_review_agent");
        assert_eq!(overridden.failure_threshold, 2);
        assert_eq!(overridden.recovery_timeout, Duration::from_secs(60));

        let default = settings.config_for_recipient("validation_agent");
        assert_eq!(default.failure_threshold, 5);
    }
}
