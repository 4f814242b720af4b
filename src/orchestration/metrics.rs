//! Per-role performance tracking.
//!
//! Exponential moving averages of success rate and response time, kept apart from
//! the circuit breaker's binary open/closed signal.

use crate::roles::Role;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolePerformance {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// Smoothed success rate (0.0 to 1.0)
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug)]
pub struct PerformanceTracker {
    smoothing: f64,
    roles: Mutex<BTreeMap<Role, RolePerformance>>,
}

impl PerformanceTracker {
    pub fn new(smoothing: f64) -> Self {
        Self {
            smoothing: smoothing.clamp(f64::EPSILON, 1.0),
            roles: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn record(&self, role: Role, success: bool, elapsed: Duration) {
        let sample_rate = if success { 1.0 } else { 0.0 };
        let sample_ms = elapsed.as_secs_f64() * 1000.0;
        let alpha = self.smoothing;

        let mut roles = self.roles.lock();
        let entry = roles.entry(role).or_insert_with(|| RolePerformance {
            attempts: 0,
            successes: 0,
            failures: 0,
            success_rate: sample_rate,
            avg_response_time_ms: sample_ms,
            last_updated: Utc::now(),
        });

        if entry.attempts > 0 {
            entry.success_rate = alpha * sample_rate + (1.0 - alpha) * entry.success_rate;
            entry.avg_response_time_ms =
                alpha * sample_ms + (1.0 - alpha) * entry.avg_response_time_ms;
        }
        entry.attempts += 1;
        if success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
        entry.last_updated = Utc::now();
    }

    pub fn get(&self, role: Role) -> Option<RolePerformance> {
        self.roles.lock().get(&role).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<Role, RolePerformance> {
        self.roles.lock().clone()
    }
}
