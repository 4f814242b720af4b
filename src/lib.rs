#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Research Relay Core
//!
//! Reliable agent messaging and workflow orchestration for multi-party research
//! data access pipelines.
//!
//! ## Overview
//!
//! A research query passes through a fixed chain of specialized agents: input
//! validation, consent checks, ethics review, data retrieval, anonymization and
//! knowledge reasoning. This crate provides the substrate those agents talk over
//! and the orchestrator that drives a query through them.
//!
//! ## Module Organization
//!
//! - [`messaging`] - Priority queue, acknowledgments, retries and dead letters
//! - [`resilience`] - Per-recipient circuit breakers and backoff policy
//! - [`communication`] - Middleware, request/response correlation, broadcasts and conversations
//! - [`roles`] - Agent roles, their output contracts and in-process role handlers
//! - [`orchestration`] - Workflow state machine, recovery, compensation, aggregation and audit
//! - [`config`] - Layered configuration with validation
//! - [`logging`] - Structured logging setup and helpers
//! - [`error`] - Crate-level error type
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use research_relay::config::RelayConfig;
//! use research_relay::orchestration::{OrchestrationSystem, PlanInput};
//! use research_relay::roles::RoleRegistry;
//! use std::time::Duration;
//!
//! # async fn example(registry: RoleRegistry) -> research_relay::Result<()> {
//! let system = OrchestrationSystem::in_process(RelayConfig::default(), registry)?;
//!
//! let input = PlanInput::new("q-42", "researcher-7").with_data_sources(["ehr"]);
//! let workflow_id = system.orchestrator().submit_workflow(input)?;
//!
//! let report = system
//!     .orchestrator()
//!     .wait_for_completion(workflow_id, Duration::from_secs(60))
//!     .await?;
//! println!("workflow finished as {:?}", report.status);
//!
//! system.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod communication;
pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod orchestration;
pub mod resilience;
pub mod roles;

pub use communication::{CommunicationError, CommunicationManager, RequestOptions, SendOptions};
pub use config::{ConfigManager, RelayConfig};
pub use error::{RelayError, Result};
pub use messaging::{
    Acknowledgment, DeliveryOutcome, Message, MessageDeliveryService, MessageKind,
    MessagePayload, MessagePriority, MessagingError, Transport,
};
pub use orchestration::{
    CancelOutcome, OrchestrationError, OrchestrationSystem, PlanInput, WorkflowOrchestrator,
    WorkflowStatus, WorkflowStatusReport,
};
pub use resilience::{BackoffPolicy, CircuitBreakerManager, CircuitState};
pub use roles::{RecoveryStrategy, Role, RoleHandler, RoleRegistry};
