//! Shared helpers for integration tests: scripted role handlers, a counting
//! transport and a configuration tuned for fast test runs.

#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use research_relay::config::RelayConfig;
use research_relay::messaging::{
    AckSender, CompensationRequest, Message, MessagingResult, StepRequest, Transport,
};
use research_relay::orchestration::OrchestrationSystem;
use research_relay::roles::{LocalRoleTransport, Role, RoleHandler, RoleRegistry};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Configuration with millisecond-scale polling, backoff and timeouts
pub fn fast_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.environment = "test".to_string();

    config.delivery.poll_interval_ms = 2;
    config.delivery.ack_timeout_ms = 5_000;
    config.delivery.default_max_retries = 0;
    config.delivery.base_delay_ms = 1;
    config.delivery.max_delay_ms = 5;
    config.delivery.jitter_enabled = false;

    config.orchestration.default_base_delay_ms = 1;
    config.orchestration.default_max_delay_ms = 5;
    config.orchestration.default_step_timeout_ms = 2_000;
    config.orchestration.workflow_timeout_secs = 30;
    config
}

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("research_relay=debug")
        .with_test_writer()
        .try_init();
}

/// Well-formed output for each role, clearing every quality threshold
pub fn standard_output(role: Role) -> Value {
    match role {
        Role::Validation => json!({ "valid": true }),
        Role::ConsentCheck => json!({ "consent_granted": true }),
        Role::EthicsReview => json!({ "approved": true, "ethics_score": 0.9 }),
        Role::DataRetrieval => json!({ "record_count": 12, "fields": ["age", "diagnosis"] }),
        Role::Anonymization => json!({ "anonymized": true, "quality_score": 0.95 }),
        Role::KnowledgeReasoning => {
            json!({ "insights": ["cohort skews older"], "confidence": 0.85 })
        }
    }
}

/// Role handler with scripted behavior and call counters
#[derive(Debug)]
pub struct ScriptedHandler {
    output: Value,
    /// Attempts that fail before the handler starts succeeding
    fail_first: usize,
    delay: Duration,
    fail_compensation: bool,
    calls: AtomicUsize,
    compensations: AtomicUsize,
}

impl ScriptedHandler {
    fn build(output: Value, fail_first: usize, delay: Duration) -> Self {
        Self {
            output,
            fail_first,
            delay,
            fail_compensation: false,
            calls: AtomicUsize::new(0),
            compensations: AtomicUsize::new(0),
        }
    }

    pub fn succeeding(output: Value) -> Arc<Self> {
        Arc::new(Self::build(output, 0, Duration::ZERO))
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self::build(Value::Null, usize::MAX, Duration::ZERO))
    }

    pub fn flaky(fail_first: usize, output: Value) -> Arc<Self> {
        Arc::new(Self::build(output, fail_first, Duration::ZERO))
    }

    pub fn slow(delay: Duration, output: Value) -> Arc<Self> {
        Arc::new(Self::build(output, 0, delay))
    }

    pub fn with_failing_compensation(output: Value) -> Arc<Self> {
        let mut handler = Self::build(output, 0, Duration::ZERO);
        handler.fail_compensation = true;
        Arc::new(handler)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn compensations(&self) -> usize {
        self.compensations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoleHandler for ScriptedHandler {
    async fn execute(&self, request: StepRequest) -> anyhow::Result<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if call < self.fail_first {
            anyhow::bail!("scripted failure #{} for {}", call + 1, request.step_name);
        }
        Ok(self.output.clone())
    }

    async fn compensate(&self, request: &CompensationRequest) -> anyhow::Result<()> {
        self.compensations.fetch_add(1, Ordering::SeqCst);
        if self.fail_compensation {
            anyhow::bail!("cannot {}", request.action_type);
        }
        Ok(())
    }
}

/// One scripted handler per role; unspecified roles succeed with [`standard_output`]
#[derive(Debug, Clone)]
pub struct Harness {
    handlers: BTreeMap<Role, Arc<ScriptedHandler>>,
}

impl Harness {
    pub fn standard() -> Self {
        Self {
            handlers: Role::ALL
                .into_iter()
                .map(|role| (role, ScriptedHandler::succeeding(standard_output(role))))
                .collect(),
        }
    }

    pub fn with(mut self, role: Role, handler: Arc<ScriptedHandler>) -> Self {
        self.handlers.insert(role, handler);
        self
    }

    /// Drop a role's handler so its agent is unreachable
    pub fn without(mut self, role: Role) -> Self {
        self.handlers.remove(&role);
        self
    }

    pub fn handler(&self, role: Role) -> &Arc<ScriptedHandler> {
        &self.handlers[&role]
    }

    pub fn registry(&self) -> RoleRegistry {
        self.handlers
            .iter()
            .fold(RoleRegistry::new(), |registry, (role, handler)| {
                let handler: Arc<dyn RoleHandler> = handler.clone();
                registry.with_handler(*role, handler)
            })
    }
}

/// Wraps a transport and counts send attempts per recipient
#[derive(Debug)]
pub struct CountingTransport {
    inner: Arc<dyn Transport>,
    sends: DashMap<String, usize>,
}

impl CountingTransport {
    pub fn new(inner: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            sends: DashMap::new(),
        })
    }

    pub fn sends_to(&self, recipient: &str) -> usize {
        self.sends.get(recipient).map_or(0, |count| *count)
    }

    pub fn total_sends(&self) -> usize {
        self.sends.iter().map(|entry| *entry.value()).sum()
    }
}

#[async_trait]
impl Transport for CountingTransport {
    async fn send(&self, message: &Message, acks: &AckSender) -> MessagingResult<()> {
        *self.sends.entry(message.recipient.clone()).or_insert(0) += 1;
        self.inner.send(message, acks).await
    }
}

/// Bootstrap an in-process system whose transport counts every send
pub fn start_system(
    config: RelayConfig,
    harness: &Harness,
) -> (OrchestrationSystem, Arc<CountingTransport>) {
    let transport = CountingTransport::new(Arc::new(LocalRoleTransport::new(harness.registry())));
    let system = OrchestrationSystem::bootstrap(config, transport.clone())
        .expect("test configuration is valid");
    (system, transport)
}
