//! # Roles
//!
//! Closed set of step handler categories, the handler contract they implement, and
//! an in-process transport that dispatches messages to registered handlers.

pub mod handler;
pub mod role;
pub mod transport;

pub use handler::{RoleHandler, RoleRegistry};
pub use role::{RecoveryStrategy, Role, RolePolicy};
pub use transport::LocalRoleTransport;
