//! Core components of the permitgate admission library
//!
//! This module contains the fundamental building blocks:
//! - [`pool`]: Resizable permit pools (the unit every gate is built from)
//! - [`gate`]: The multi-level admission gate and its RAII permit
//! - [`rate_limiter`]: Fixed-window call-rate limiting with burst spacing
//! - [`tuner`]: Load-driven resizing of pool capacities
//! - [`reaper`]: Eviction of idle per-identity state
//! - [`stats`]: Read-only snapshots for monitoring

pub mod gate;
pub mod pool;
pub mod rate_limiter;
pub mod reaper;
pub mod stats;
pub mod tuner;

pub use gate::{AdmissionGate, AdmissionGateBuilder, AdmissionPermit};
pub use pool::{PermitPool, PoolBounds};
pub use rate_limiter::{RateLimitConfig, RateLimitConfigBuilder, RateLimitKey, RateLimiter};
pub use reaper::IdleReaper;
pub use stats::{
    AdmissionStats, IdentityStats, MonitoringReport, PoolStats, RateLimiterStats, StatsReporter,
};
pub use tuner::{
    DynamicTuner, LoadSignals, LoadSnapshot, TuningDecision, TuningOutcome, TuningPolicy,
    TuningPolicyBuilder,
};

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// The level of the admission gate that turned a request away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolScope {
    /// The process-wide pool
    Global,
    /// A per-request-type pool (llm, streaming, asr, tts, ...)
    Type,
    /// A per-identity pool
    Identity,
}

impl fmt::Display for PoolScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolScope::Global => write!(f, "global"),
            PoolScope::Type => write!(f, "type"),
            PoolScope::Identity => write!(f, "identity"),
        }
    }
}

/// Which rate-limit rule rejected a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitReason {
    /// The fixed window already holds `max_per_window` calls
    WindowExhausted,
    /// The previous call was less than `min_spacing` ago
    TooSoon,
}

impl fmt::Display for RateLimitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitReason::WindowExhausted => write!(f, "window quota exhausted"),
            RateLimitReason::TooSoon => write!(f, "minimum spacing not elapsed"),
        }
    }
}

/// Errors produced by admission control
///
/// # Variants
///
/// - [`OverCapacity`](GateError::OverCapacity) and
///   [`RateLimited`](GateError::RateLimited) are returned to callers. Both are
///   recoverable: the caller should answer "busy, retry later".
/// - [`AccountingAnomaly`](GateError::AccountingAnomaly) describes a release
///   that did not match an acquire. It is logged by the gate and never
///   propagated out of a release path.
/// - [`TunerCycle`](GateError::TunerCycle) and
///   [`ReaperCycle`](GateError::ReaperCycle) are reported by background
///   loops, which log them and continue with the next cycle.
/// - [`InvalidConfig`](GateError::InvalidConfig) comes from builder
///   validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GateError {
    #[error("over capacity: {scope} pool exhausted")]
    OverCapacity { scope: PoolScope },
    #[error("rate limited: {reason} (retry after {retry_after:?})")]
    RateLimited {
        reason: RateLimitReason,
        retry_after: Duration,
    },
    #[error("accounting anomaly in {pool}: {detail}")]
    AccountingAnomaly { pool: String, detail: String },
    #[error("tuner cycle failed: {0}")]
    TunerCycle(String),
    #[error("reaper cycle failed: {0}")]
    ReaperCycle(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GateError {
    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GateError::OverCapacity { .. } | GateError::RateLimited { .. }
        )
    }
}
