//! # Circuit Breaker Manager
//!
//! Owns the per-recipient breaker table. Breakers are created lazily on first use
//! from [`CircuitBreakerSettings`], honouring per-recipient overrides.

use crate::config::CircuitBreakerSettings;
use crate::resilience::{
    CircuitBreaker, CircuitBreakerError, CircuitState, SystemCircuitBreakerMetrics,
};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug)]
pub struct CircuitBreakerManager {
    circuit_breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    settings: CircuitBreakerSettings,
}

impl CircuitBreakerManager {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        info!(
            enabled = settings.enabled,
            failure_threshold = settings.failure_threshold,
            overrides = settings.recipient_overrides.len(),
            "Initializing circuit breaker manager"
        );

        Self {
            circuit_breakers: RwLock::new(HashMap::new()),
            settings,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Get or create the breaker for a recipient
    pub fn get_circuit_breaker(&self, recipient: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.circuit_breakers.read().get(recipient) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.circuit_breakers.write();

        // Double-check pattern (another caller might have created it)
        if let Some(breaker) = breakers.get(recipient) {
            return Arc::clone(breaker);
        }

        if breakers.len() >= self.settings.max_circuit_breakers {
            // Open and half-open breakers are never evicted; they hold fail-fast state.
            let closed = breakers
                .iter()
                .filter(|(_, breaker)| breaker.state() == CircuitState::Closed)
                .map(|(name, _)| name.clone())
                .min();

            match closed {
                Some(evicted) => {
                    breakers.remove(&evicted);
                    info!(
                        recipient = recipient,
                        evicted = %evicted,
                        "Evicted closed circuit breaker to stay within limit"
                    );
                }
                None => {
                    warn!(
                        recipient = recipient,
                        current_count = breakers.len(),
                        max_allowed = self.settings.max_circuit_breakers,
                        "🚨 Maximum circuit breaker limit reached, using untracked breaker"
                    );
                    return Arc::new(CircuitBreaker::new(
                        recipient,
                        self.settings.config_for_recipient(recipient),
                    ));
                }
            }
        }

        let breaker = Arc::new(CircuitBreaker::new(
            recipient,
            self.settings.config_for_recipient(recipient),
        ));
        breakers.insert(recipient.to_string(), Arc::clone(&breaker));

        info!(
            recipient = recipient,
            total_circuit_breakers = breakers.len(),
            "Created new circuit breaker"
        );

        breaker
    }

    /// Gate one call to `recipient`; always passes when breakers are disabled
    pub fn try_acquire(&self, recipient: &str) -> Result<(), CircuitBreakerError> {
        if !self.settings.enabled {
            return Ok(());
        }
        self.get_circuit_breaker(recipient).try_acquire()
    }

    pub fn record_success(&self, recipient: &str) {
        if self.settings.enabled {
            self.get_circuit_breaker(recipient).record_success();
        }
    }

    pub fn record_failure(&self, recipient: &str) {
        if self.settings.enabled {
            self.get_circuit_breaker(recipient).record_failure();
        }
    }

    /// State of an existing breaker; recipients never contacted have none
    pub fn state(&self, recipient: &str) -> Option<CircuitState> {
        self.circuit_breakers
            .read()
            .get(recipient)
            .map(|breaker| breaker.state())
    }

    pub fn list_recipients(&self) -> Vec<String> {
        let mut names: Vec<String> = self.circuit_breakers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn snapshot(&self) -> SystemCircuitBreakerMetrics {
        let circuit_breakers: std::collections::BTreeMap<_, _> = self
            .circuit_breakers
            .read()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.metrics()))
            .collect();
        let open_circuits = circuit_breakers
            .values()
            .filter(|m| m.current_state == CircuitState::Open)
            .count();

        SystemCircuitBreakerMetrics {
            enabled: self.settings.enabled,
            circuit_breakers,
            open_circuits,
            collected_at: Utc::now(),
        }
    }

    /// Force every breaker closed
    pub fn reset_all(&self) {
        for breaker in self.circuit_breakers.read().values() {
            breaker.force_closed();
        }
        info!("All circuit breakers reset");
    }
}
