//! # System Constants
//!
//! Operational defaults and event names shared by the messaging substrate and the
//! workflow orchestrator. Configuration defaults in [`crate::config`] are built from
//! these values so the two never drift apart.

/// Delivery layer defaults
pub mod delivery {
    /// Dead letter queue capacity before the oldest entry is evicted
    pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 1000;
    /// Pending acknowledgments older than this are expired by the cleanup sweep
    pub const DEFAULT_STALE_PENDING_TIMEOUT_SECS: u64 = 600;
    pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 30_000;
    pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 60_000;
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
    pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
    pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
    pub const DEFAULT_JITTER_MAX_PERCENTAGE: f64 = 0.1;
    /// Smoothing factor for the moving-average delivery latency
    pub const DEFAULT_LATENCY_SMOOTHING: f64 = 0.1;
}

/// Circuit breaker defaults
pub mod resilience {
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
    pub const DEFAULT_RECOVERY_TIMEOUT_SECS: u64 = 60;
    pub const DEFAULT_MAX_CIRCUIT_BREAKERS: usize = 256;
}

/// Communication manager defaults
pub mod communication {
    pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
    pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;
}

/// Orchestrator defaults
pub mod orchestration {
    pub const DEFAULT_MAX_CONCURRENT_WORKFLOWS: usize = 10;
    pub const DEFAULT_WORKFLOW_TIMEOUT_SECS: u64 = 600;
    pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 30_000;
    /// Sub-scores below this value are listed in recommendations
    pub const DEFAULT_QUALITY_THRESHOLD: f64 = 0.7;
    /// Multiplier applied to sub-scores computed from recovered (low-confidence) output
    pub const DEFAULT_LOW_CONFIDENCE_PENALTY: f64 = 0.5;
    /// Exponential moving average smoothing for per-role performance metrics
    pub const DEFAULT_METRICS_SMOOTHING: f64 = 0.1;
    /// Finished workflows kept for status queries before the oldest are dropped
    pub const DEFAULT_HISTORY_CAPACITY: usize = 1_000;
    /// Outputs remembered for `CachedResult` recovery before the oldest are evicted
    pub const DEFAULT_RECOVERY_CACHE_CAPACITY: usize = 1_000;
    /// Identity used as sender for messages emitted by the orchestrator
    pub const ORCHESTRATOR_AGENT_ID: &str = "orchestrator";
}

/// Audit trail defaults
pub mod audit {
    pub const DEFAULT_MAX_EVENTS: usize = 10_000;
    pub const DEFAULT_TRIM_TO: usize = 5_000;
}

/// Structured log operation names
pub mod events {
    pub const WORKFLOW_SUBMITTED: &str = "workflow.submitted";
    pub const WORKFLOW_FINALIZED: &str = "workflow.finalized";
    pub const WORKFLOW_CANCEL_REQUESTED: &str = "workflow.cancel_requested";
    pub const STEP_ATTEMPT: &str = "step.attempt";
    pub const STEP_COMPLETED: &str = "step.completed";
    pub const STEP_FAILED: &str = "step.failed";
    pub const MESSAGE_SENT: &str = "message.sent";
    pub const MESSAGE_RETRIED: &str = "message.retried";
    pub const MESSAGE_DEAD_LETTERED: &str = "message.dead_lettered";
}
