//! # Crate Error Types
//!
//! Each subsystem owns a `thiserror` enum; [`RelayError`] is the umbrella type used at
//! the crate boundary (bootstrap, configuration loading).

use crate::communication::CommunicationError;
use crate::config::ConfigurationError;
use crate::messaging::MessagingError;
use crate::orchestration::OrchestrationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Communication(#[from] CommunicationError),

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),
}

pub type Result<T> = std::result::Result<T, RelayError>;
