//! # Resilience Module
//!
//! Fault isolation for message recipients: per-recipient circuit breakers, the
//! breaker table that owns them, and the exponential backoff used for retries.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use research_relay::resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CircuitBreakerConfig {
//!     failure_threshold: 5,
//!     recovery_timeout: Duration::from_secs(60),
//! };
//!
//! let breaker = CircuitBreaker::new("ethics_review_agent", config);
//!
//! let verdict = breaker.call(|| async {
//!     Ok::<&str, std::io::Error>("approved")
//! }).await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod config;
pub mod manager;
pub mod metrics;

pub use backoff::BackoffPolicy;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use config::CircuitBreakerConfig;
pub use manager::CircuitBreakerManager;
pub use metrics::{CircuitBreakerMetrics, SystemCircuitBreakerMetrics};
