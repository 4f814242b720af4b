//! Role handler contract and registry.

use super::Role;
use crate::messaging::{CompensationRequest, StepRequest};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Business logic behind one role.
///
/// `execute` returns the step output, which must satisfy the role's required-fields
/// contract. Errors are opaque to the orchestrator and surface as remote failures.
#[async_trait]
pub trait RoleHandler: Send + Sync {
    async fn execute(&self, request: StepRequest) -> anyhow::Result<serde_json::Value>;

    /// Undo a committed step; handlers without side effects keep the default
    async fn compensate(&self, _request: &CompensationRequest) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Handlers keyed by role
#[derive(Clone, Default)]
pub struct RoleRegistry {
    handlers: HashMap<Role, Arc<dyn RoleHandler>>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, role: Role, handler: Arc<dyn RoleHandler>) -> &mut Self {
        self.handlers.insert(role, handler);
        self
    }

    pub fn with_handler(mut self, role: Role, handler: Arc<dyn RoleHandler>) -> Self {
        self.register(role, handler);
        self
    }

    pub fn get(&self, role: Role) -> Option<Arc<dyn RoleHandler>> {
        self.handlers.get(&role).cloned()
    }

    pub fn contains(&self, role: Role) -> bool {
        self.handlers.contains_key(&role)
    }

    pub fn roles(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self.handlers.keys().copied().collect();
        roles.sort();
        roles
    }
}

impl fmt::Debug for RoleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleRegistry")
            .field("roles", &self.roles())
            .finish()
    }
}
