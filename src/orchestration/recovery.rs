//! # Step Recovery
//!
//! Runs once a step has spent its retry budget. A successful recovery produces a
//! substitute output that is always flagged low-confidence; the workflow continues
//! with it. Anything else fails the workflow.
//!
//! Substitute outputs must still satisfy the role's required-fields contract.

use crate::messaging::StepRequest;
use crate::roles::{RecoveryStrategy, Role};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Produces a substitute output for a step whose role handler kept failing.
///
/// No provider is registered by default: fabricated substitutes are an explicit
/// opt-in, and their outputs are always marked low-confidence.
#[async_trait]
pub trait FallbackProvider: Send + Sync + Debug {
    async fn fallback(&self, request: &StepRequest) -> anyhow::Result<serde_json::Value>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    Recovered {
        output: serde_json::Value,
        via: RecoveryStrategy,
    },
    /// Handed to a human; the workflow fails
    Escalated { reason: String },
    Failed { reason: String },
}

type CacheKey = (Role, String);

/// Insertion-ordered cache of successful outputs, evicting the oldest entry
#[derive(Debug, Default)]
struct ResultCache {
    entries: HashMap<CacheKey, serde_json::Value>,
    order: VecDeque<CacheKey>,
}

#[derive(Debug)]
pub struct RecoveryManager {
    cache: Mutex<ResultCache>,
    cache_capacity: usize,
    fallbacks: RwLock<HashMap<Role, Arc<dyn FallbackProvider>>>,
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new(crate::constants::orchestration::DEFAULT_RECOVERY_CACHE_CAPACITY)
    }
}

impl RecoveryManager {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            cache: Mutex::new(ResultCache::default()),
            cache_capacity: cache_capacity.max(1),
            fallbacks: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_fallback(&self, role: Role, provider: Arc<dyn FallbackProvider>) {
        info!(role = %role, "Fallback provider registered");
        self.fallbacks.write().insert(role, provider);
    }

    /// Remember a successful handler output, but only for roles that recover from cache
    pub fn remember(
        &self,
        strategy: RecoveryStrategy,
        role: Role,
        input: &serde_json::Value,
        output: &serde_json::Value,
    ) {
        if strategy != RecoveryStrategy::CachedResult {
            return;
        }

        let key = (role, cache_key(input));
        let mut cache = self.cache.lock();
        if let Some(existing) = cache.entries.get_mut(&key) {
            *existing = output.clone();
            return;
        }
        while cache.entries.len() >= self.cache_capacity {
            let Some(oldest) = cache.order.pop_front() else {
                break;
            };
            cache.entries.remove(&oldest);
        }
        cache.order.push_back(key.clone());
        cache.entries.insert(key, output.clone());
    }

    pub fn cached(&self, role: Role, input: &serde_json::Value) -> Option<serde_json::Value> {
        self.cache
            .lock()
            .entries
            .get(&(role, cache_key(input)))
            .cloned()
    }

    /// Outputs currently held for `CachedResult` recovery
    pub fn cached_len(&self) -> usize {
        self.cache.lock().entries.len()
    }

    pub async fn recover(
        &self,
        strategy: RecoveryStrategy,
        request: &StepRequest,
        last_error: &str,
    ) -> RecoveryOutcome {
        let role = request.role;
        let candidate = match strategy {
            RecoveryStrategy::CachedResult => match self.cached(role, &request.input) {
                Some(output) => output,
                None => {
                    return RecoveryOutcome::Failed {
                        reason: format!("no cached result for {role}"),
                    }
                }
            },
            RecoveryStrategy::Fallback => {
                let provider = self.fallbacks.read().get(&role).cloned();
                let Some(provider) = provider else {
                    return RecoveryOutcome::Failed {
                        reason: format!("no fallback provider registered for {role}"),
                    };
                };
                match provider.fallback(request).await {
                    Ok(output) => output,
                    Err(err) => {
                        warn!(role = %role, step = %request.step_name, error = %err, "Fallback provider failed");
                        return RecoveryOutcome::Failed {
                            reason: format!("fallback failed: {err:#}"),
                        };
                    }
                }
            }
            RecoveryStrategy::Escalate => {
                return RecoveryOutcome::Escalated {
                    reason: format!("escalated after retries exhausted: {last_error}"),
                }
            }
            RecoveryStrategy::None => {
                return RecoveryOutcome::Failed {
                    reason: format!("no recovery configured: {last_error}"),
                }
            }
        };

        let missing = role.missing_fields(&candidate);
        if !missing.is_empty() {
            return RecoveryOutcome::Failed {
                reason: format!("recovered output is missing required fields: {missing:?}"),
            };
        }

        debug!(role = %role, step = %request.step_name, ?strategy, "Step recovered");
        RecoveryOutcome::Recovered {
            output: flag_low_confidence(candidate, strategy),
            via: strategy,
        }
    }
}

fn cache_key(input: &serde_json::Value) -> String {
    input.to_string()
}

fn flag_low_confidence(mut output: serde_json::Value, via: RecoveryStrategy) -> serde_json::Value {
    if let Some(object) = output.as_object_mut() {
        object.insert("low_confidence".to_string(), serde_json::Value::Bool(true));
        object.insert(
            "recovered_via".to_string(),
            serde_json::to_value(via).unwrap_or(serde_json::Value::Null),
        );
    }
    output
}
