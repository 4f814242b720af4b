//! # Orchestration Bootstrap
//!
//! Wires the delivery service, circuit breakers, communication manager and
//! workflow orchestrator together from one [`RelayConfig`].
//!
//! - [`OrchestrationSystem::bootstrap`] takes any [`Transport`]
//! - [`OrchestrationSystem::in_process`] dispatches to local role handlers
//! - [`OrchestrationSystem::from_config_manager`] loads layered configuration first

use super::orchestrator::WorkflowOrchestrator;
use crate::communication::CommunicationManager;
use crate::config::{ConfigManager, RelayConfig};
use crate::constants::orchestration::ORCHESTRATOR_AGENT_ID;
use crate::error::Result;
use crate::messaging::{MessageDeliveryService, Transport};
use crate::resilience::CircuitBreakerManager;
use crate::roles::{LocalRoleTransport, RoleRegistry};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Running orchestration stack
#[derive(Debug)]
pub struct OrchestrationSystem {
    config: RelayConfig,
    delivery: Arc<MessageDeliveryService>,
    breakers: Arc<CircuitBreakerManager>,
    communication: Arc<CommunicationManager>,
    orchestrator: WorkflowOrchestrator,
    running: AtomicBool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub running: bool,
    pub environment: String,
    pub circuit_breakers_enabled: bool,
    pub active_workflows: usize,
    pub queue_depth: usize,
    pub pending_acks: usize,
    pub dead_letters: usize,
}

impl OrchestrationSystem {
    /// Validate `config` and start every component on top of `transport`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bootstrap(config: RelayConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        info!(environment = %config.environment, "🚀 BOOTSTRAP: Starting orchestration system");
        config.validate()?;

        let delivery = Arc::new(MessageDeliveryService::new(config.delivery.clone(), transport));
        delivery.start();

        let breakers = Arc::new(CircuitBreakerManager::new(config.circuit_breaker.clone()));
        info!(
            enabled = breakers.is_enabled(),
            "🛡️ BOOTSTRAP: Circuit breakers configured"
        );

        let communication = Arc::new(CommunicationManager::new(
            ORCHESTRATOR_AGENT_ID,
            Arc::clone(&delivery),
            Arc::clone(&breakers),
            config.communication.clone(),
        ));
        let orchestrator = WorkflowOrchestrator::new(
            config.orchestration.clone(),
            config.audit.clone(),
            Arc::clone(&communication),
        );

        info!("✅ BOOTSTRAP: Orchestration system ready");
        Ok(Self {
            config,
            delivery,
            breakers,
            communication,
            orchestrator,
            running: AtomicBool::new(true),
        })
    }

    /// Bootstrap with role handlers running in this process
    pub fn in_process(config: RelayConfig, registry: RoleRegistry) -> Result<Self> {
        Self::bootstrap(config, Arc::new(LocalRoleTransport::new(registry)))
    }

    /// Load configuration (file, then `RELAY_` environment overrides) and bootstrap
    pub fn from_config_manager(
        path: Option<&Path>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let manager = ConfigManager::load(path)?;
        Self::bootstrap(manager.config().clone(), transport)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &WorkflowOrchestrator {
        &self.orchestrator
    }

    pub fn communication(&self) -> &Arc<CommunicationManager> {
        &self.communication
    }

    pub fn delivery(&self) -> &Arc<MessageDeliveryService> {
        &self.delivery
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            running: self.is_running(),
            environment: self.config.environment.clone(),
            circuit_breakers_enabled: self.breakers.is_enabled(),
            active_workflows: self.orchestrator.active_workflow_ids().len(),
            queue_depth: self.delivery.queue_depth(),
            pending_acks: self.delivery.pending_ack_count(),
            dead_letters: self.delivery.dead_letters().len(),
        }
    }

    /// Cancel active workflows, then stop the delivery service
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            warn!("Orchestration system already stopped");
            return;
        }
        info!("🛑 Orchestration system shutdown requested");
        self.orchestrator.shutdown().await;
        self.delivery.shutdown().await;
    }
}
