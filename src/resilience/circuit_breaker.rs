//! # Circuit Breaker Implementation
//!
//! Per-recipient fail-fast gate with three states: Closed (normal operation),
//! Open (rejecting every call) and Half-Open (exactly one trial call in flight).
//!
//! Callers either wrap an operation with [`CircuitBreaker::call`] or drive the
//! breaker manually with [`CircuitBreaker::try_acquire`] followed by
//! [`CircuitBreaker::record_success`] / [`CircuitBreaker::record_failure`] when the
//! outcome arrives later (e.g. through an acknowledgment).

use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// Testing recovery - a single trial call call is allowed
    HalfOpen,
}

/// Errors that can occur during circuit breaker operation
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E = Infallible> {
    /// Circuit is open, rejecting all calls
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// Operation failed and was recorded
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    /// Set while the half-open trial call is outstanding
    trial_started_at: Option<Instant>,
    total_calls: u64,
    success_count: u64,
    failure_count: u64,
    rejected_calls: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    /// Recipient this breaker protects
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout.as_millis() as u64,
            "🛡️ Circuit breaker initialized"
        );

        Self {
            name,
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                trial_started_at: None,
                total_calls: 0,
                success_count: 0,
                failure_count: 0,
                rejected_calls: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Ask permission for one call.
    ///
    /// Open circuits admit a single trial call once `recovery_timeout` has elapsed since the
    /// last failure; every other caller is rejected until the trial call reports back. A
    /// trial call that never reports is replaced after another `recovery_timeout`.
    pub fn try_acquire(&self) -> Result<(), CircuitBreakerError> {
        let mut state = self.state.lock();
        let now = Instant::now();

        let current = state.state;
        let admitted = match current {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = state
                    .last_failure_at
                    .map_or(true, |at| now.duration_since(at) >= self.config.recovery_timeout);
                if cooled_down {
                    state.state = CircuitState::HalfOpen;
                    state.trial_started_at = Some(now);
                    info!(component = %self.name, "🟡 Circuit breaker half-open (probing recovery)");
                }
                cooled_down
            }
            CircuitState::HalfOpen => {
                let trial_abandoned = state
                    .trial_started_at
                    .map_or(true, |at| now.duration_since(at) >= self.config.recovery_timeout);
                if trial_abandoned {
                    state.trial_started_at = Some(now);
                }
                trial_abandoned
            }
        };

        if admitted {
            Ok(())
        } else {
            state.rejected_calls += 1;
            debug!(component = %self.name, state = ?state.state, "Circuit breaker rejected call");
            Err(CircuitBreakerError::CircuitOpen {
                component: self.name.clone(),
            })
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.total_calls += 1;
        state.success_count += 1;
        state.consecutive_failures = 0;

        let current = state.state;
        match current {
            CircuitState::HalfOpen => {
                state.state = CircuitState::Closed;
                state.trial_started_at = None;
                info!(
                    component = %self.name,
                    total_calls = state.total_calls,
                    "🟢 Circuit breaker closed (recovered)"
                );
            }
            CircuitState::Open => {
                // A call admitted before the circuit opened finished late.
                debug!(component = %self.name, "Success recorded while circuit is open");
            }
            CircuitState::Closed => {}
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.total_calls += 1;
        state.failure_count += 1;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure_at = Some(Instant::now());

        let current = state.state;
        let tripped = state.consecutive_failures >= self.config.failure_threshold;
        match current {
            CircuitState::Closed if tripped => {
                state.state = CircuitState::Open;
                error!(
                    component = %self.name,
                    consecutive_failures = state.consecutive_failures,
                    failure_threshold = self.config.failure_threshold,
                    "🔴 Circuit breaker opened (failing fast)"
                );
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.trial_started_at = None;
                warn!(component = %self.name, "🔴 Recovery trial call failed, circuit re-opened");
            }
            _ => {}
        }
    }

    /// Execute an operation with circuit breaker protection
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Err(CircuitBreakerError::CircuitOpen { component }) = self.try_acquire() {
            return Err(CircuitBreakerError::CircuitOpen { component });
        }

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result.map_err(CircuitBreakerError::OperationFailed)
    }

    /// Force circuit to open state (for emergency situations)
    pub fn force_open(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced open");
        let mut state = self.state.lock();
        state.state = CircuitState::Open;
        state.last_failure_at = Some(Instant::now());
        state.trial_started_at = None;
    }

    /// Force circuit to closed state (for emergency recovery)
    pub fn force_closed(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced closed");
        let mut state = self.state.lock();
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.trial_started_at = None;
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.state.lock();
        let (failure_rate, success_rate) = if state.total_calls > 0 {
            (
                state.failure_count as f64 / state.total_calls as f64,
                state.success_count as f64 / state.total_calls as f64,
            )
        } else {
            (0.0, 0.0)
        };

        CircuitBreakerMetrics {
            total_calls: state.total_calls,
            success_count: state.success_count,
            failure_count: state.failure_count,
            consecutive_failures: state.consecutive_failures,
            rejected_calls: state.rejected_calls,
            current_state: state.state,
            failure_rate,
            success_rate,
            last_failure_age_ms: state
                .last_failure_at
                .map(|at| at.elapsed().as_millis() as u64),
        }
    }
}
