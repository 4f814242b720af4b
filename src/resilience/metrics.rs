//! # Circuit Breaker Metrics
//!
//! Snapshots of breaker activity for statistics endpoints and logging.

use crate::resilience::CircuitState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metrics for a single circuit breaker instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Calls whose outcome was recorded
    pub total_calls: u64,

    pub success_count: u64,

    pub failure_count: u64,

    /// Current consecutive failure count
    pub consecutive_failures: u32,

    /// Calls rejected without being attempted
    pub rejected_calls: u64,

    pub current_state: CircuitState,

    /// Calculated failure rate (0.0 to 1.0)
    pub failure_rate: f64,

    /// Calculated success rate (0.0 to 1.0)
    pub success_rate: f64,

    /// Milliseconds since the last recorded failure
    pub last_failure_age_ms: Option<u64>,
}

impl CircuitBreakerMetrics {
    pub fn new() -> Self {
        Self {
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            rejected_calls: 0,
            current_state: CircuitState::Closed,
            failure_rate: 0.0,
            success_rate: 0.0,
            last_failure_age_ms: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        match self.current_state {
            CircuitState::Closed => self.failure_rate < 0.1,
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
        }
    }

    /// Get human-readable state description
    pub fn state_description(&self) -> &'static str {
        match self.current_state {
            CircuitState::Closed => "Healthy - Normal operation",
            CircuitState::Open => "Failing - Rejecting all calls",
            CircuitState::HalfOpen => "Recovering - Probing recipient",
        }
    }

    /// Format metrics for logging
    pub fn format_summary(&self) -> String {
        format!(
            "State: {} | Calls: {} | Success: {:.1}% | Failures: {} | Rejected: {}",
            self.state_description(),
            self.total_calls,
            self.success_rate * 100.0,
            self.failure_count,
            self.rejected_calls
        )
    }
}

impl Default for CircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Breaker table snapshot keyed by recipient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemCircuitBreakerMetrics {
    pub enabled: bool,
    pub circuit_breakers: BTreeMap<String, CircuitBreakerMetrics>,
    pub open_circuits: usize,
    pub collected_at: DateTime<Utc>,
}

impl SystemCircuitBreakerMetrics {
    pub fn open_recipients(&self) -> Vec<&str> {
        self.circuit_breakers
            .iter()
            .filter(|(_, m)| m.current_state == CircuitState::Open)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_by_state() {
        let mut metrics = CircuitBreakerMetrics::new();
        assert!(metrics.is_healthy());

        metrics.current_state = CircuitState::Open;
        assert!(!metrics.is_healthy());
        assert!(metrics.format_summary().contains("Rejecting"));

        metrics.current_state = CircuitState::Closed;
        metrics.failure_rate = 0.5;
        assert!(!metrics.is_healthy());
    }
}
