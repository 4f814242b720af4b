//! # Circuit Breaker Configuration
//!
//! Per-breaker thresholds. System-wide settings and per-recipient overrides live in
//! [`crate::config::CircuitBreakerSettings`], which resolves into this type.

use crate::constants::resilience::{DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_TIMEOUT_SECS};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Thresholds for a single circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Cool-down after the last failure before a single trial call is admitted
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: Duration::from_secs(DEFAULT_RECOVERY_TIMEOUT_SECS),
        }
    }
}
