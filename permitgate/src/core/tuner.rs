//! Load-driven resizing of pool capacities
//!
//! [`DynamicTuner::tick`] runs one tuning cycle. It reads a [`LoadSnapshot`]
//! and the rejection rate since the previous tick, then either shrinks
//! every pool, grows every pool, or leaves them alone:
//!
//! | Condition                                        | Decision |
//! |--------------------------------------------------|----------|
//! | memory > `memory_high` or rejection > `rejection_high` | shrink by `shrink_factor` |
//! | memory < `memory_low` and rejection < `rejection_low`  | grow by `grow_factor`     |
//! | otherwise                                        | hold     |
//!
//! Each pool stays within its own floor and ceiling. Scheduling the ticks is
//! left to the caller.

use super::GateError;
use super::gate::AdmissionGate;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// System load as seen by the tuner
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadSnapshot {
    /// Used memory as a percentage of total, 0 to 100
    pub memory_usage_percent: f64,
    pub thread_count: usize,
}

/// Source of load readings
///
/// Implementations may fail; the tuner turns a failure into a skipped cycle.
pub trait LoadSignals: Send + Sync {
    /// # Errors
    ///
    /// Any error means no reading is available for this cycle.
    fn snapshot(&self) -> Result<LoadSnapshot, GateError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TuningDecision {
    Shrink,
    Grow,
    Hold,
}

impl fmt::Display for TuningDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TuningDecision::Shrink => write!(f, "shrink"),
            TuningDecision::Grow => write!(f, "grow"),
            TuningDecision::Hold => write!(f, "hold"),
        }
    }
}

/// Thresholds and factors of the tuning rule
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TuningPolicy {
    pub shrink_factor: f64,
    pub grow_factor: f64,
    /// Memory percentage above which pools shrink
    pub memory_high: f64,
    /// Memory percentage below which pools may grow
    pub memory_low: f64,
    /// Rejection rate (0 to 1) above which pools shrink
    pub rejection_high: f64,
    /// Rejection rate (0 to 1) below which pools may grow
    pub rejection_low: f64,
}

impl Default for TuningPolicy {
    fn default() -> Self {
        Self {
            shrink_factor: 0.8,
            grow_factor: 1.1,
            memory_high: 85.0,
            memory_low: 60.0,
            rejection_high: 0.10,
            rejection_low: 0.02,
        }
    }
}

impl TuningPolicy {
    pub fn builder() -> TuningPolicyBuilder {
        TuningPolicyBuilder::default()
    }

    /// Apply the tuning rule to one reading
    pub fn decide(&self, memory_usage_percent: f64, rejection_rate: f64) -> TuningDecision {
        if memory_usage_percent > self.memory_high || rejection_rate > self.rejection_high {
            TuningDecision::Shrink
        } else if memory_usage_percent < self.memory_low && rejection_rate < self.rejection_low {
            TuningDecision::Grow
        } else {
            TuningDecision::Hold
        }
    }

    /// # Errors
    ///
    /// Returns [`GateError::InvalidConfig`] when a factor points the wrong way
    /// or a low watermark is above its high watermark.
    pub fn validate(&self) -> Result<(), GateError> {
        if !(self.shrink_factor > 0.0 && self.shrink_factor < 1.0) {
            return Err(GateError::InvalidConfig(format!(
                "tuning: shrink factor must be in (0, 1), got {}",
                self.shrink_factor
            )));
        }
        if !(self.grow_factor > 1.0 && self.grow_factor.is_finite()) {
            return Err(GateError::InvalidConfig(format!(
                "tuning: grow factor must be greater than 1, got {}",
                self.grow_factor
            )));
        }
        if self.memory_low > self.memory_high {
            return Err(GateError::InvalidConfig(format!(
                "tuning: memory low watermark {} is above high watermark {}",
                self.memory_low, self.memory_high
            )));
        }
        if self.rejection_low > self.rejection_high {
            return Err(GateError::InvalidConfig(format!(
                "tuning: rejection low watermark {} is above high watermark {}",
                self.rejection_low, self.rejection_high
            )));
        }
        Ok(())
    }
}

/// Builder for [`TuningPolicy`]
///
/// # Example
///
/// ```
/// use permitgate::TuningPolicy;
///
/// let policy = TuningPolicy::builder()
///     .memory_watermarks(50.0, 90.0)
///     .shrink_factor(0.5)
///     .build()?;
/// assert_eq!(policy.memory_high, 90.0);
/// # Ok::<(), permitgate::GateError>(())
/// ```
#[derive(Default)]
pub struct TuningPolicyBuilder {
    policy: TuningPolicy,
}

impl TuningPolicyBuilder {
    pub fn shrink_factor(mut self, factor: f64) -> Self {
        self.policy.shrink_factor = factor;
        self
    }

    pub fn grow_factor(mut self, factor: f64) -> Self {
        self.policy.grow_factor = factor;
        self
    }

    /// Set the (low, high) memory percentages
    pub fn memory_watermarks(mut self, low: f64, high: f64) -> Self {
        self.policy.memory_low = low;
        self.policy.memory_high = high;
        self
    }

    /// Set the (low, high) rejection rates, as fractions
    pub fn rejection_watermarks(mut self, low: f64, high: f64) -> Self {
        self.policy.rejection_low = low;
        self.policy.rejection_high = high;
        self
    }

    /// # Errors
    ///
    /// See [`TuningPolicy::validate`].
    pub fn build(self) -> Result<TuningPolicy, GateError> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// What one tuning cycle saw and did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TuningOutcome {
    pub decision: TuningDecision,
    pub memory_usage_percent: f64,
    pub thread_count: usize,
    /// Rejection rate over the requests seen since the previous tick
    pub rejection_rate: f64,
    pub interval_requests: u64,
    pub global_capacity: usize,
    pub identity_limit: usize,
}

/// Resizes the pools of a gate from live load
pub struct DynamicTuner {
    gate: Arc<AdmissionGate>,
    signals: Arc<dyn LoadSignals>,
    policy: TuningPolicy,
    // (total, rejected) as of the last successful tick
    last_totals: Mutex<(u64, u64)>,
}

impl DynamicTuner {
    /// The first tick measures rejections from this point on
    pub fn new(
        gate: Arc<AdmissionGate>,
        signals: Arc<dyn LoadSignals>,
        policy: TuningPolicy,
    ) -> Self {
        let stats = gate.stats();
        Self {
            gate,
            signals,
            policy,
            last_totals: Mutex::new((stats.total_requests, stats.rejected_requests)),
        }
    }

    pub fn policy(&self) -> &TuningPolicy {
        &self.policy
    }

    /// Run one tuning cycle
    ///
    /// # Errors
    ///
    /// Returns [`GateError::TunerCycle`] when no usable load reading is
    /// available. Pools are left untouched and the next tick measures
    /// rejections over the longer interval.
    pub fn tick(&self) -> Result<TuningOutcome, GateError> {
        let load = self.signals.snapshot().map_err(|e| match e {
            GateError::TunerCycle(_) => e,
            other => GateError::TunerCycle(other.to_string()),
        })?;
        if !load.memory_usage_percent.is_finite() {
            return Err(GateError::TunerCycle(format!(
                "memory usage reading is not a number: {}",
                load.memory_usage_percent
            )));
        }

        let stats = self.gate.stats();
        let (interval_requests, interval_rejected) = {
            let mut last = self.last_totals.lock();
            let delta = (
                stats.total_requests.saturating_sub(last.0),
                stats.rejected_requests.saturating_sub(last.1),
            );
            *last = (stats.total_requests, stats.rejected_requests);
            delta
        };
        let rejection_rate = if interval_requests > 0 {
            interval_rejected as f64 / interval_requests as f64
        } else {
            0.0
        };

        let decision = self
            .policy
            .decide(load.memory_usage_percent, rejection_rate);
        match decision {
            TuningDecision::Shrink => self.gate.scale_pools(self.policy.shrink_factor),
            TuningDecision::Grow => self.gate.scale_pools(self.policy.grow_factor),
            TuningDecision::Hold => {}
        }

        let outcome = TuningOutcome {
            decision,
            memory_usage_percent: load.memory_usage_percent,
            thread_count: load.thread_count,
            rejection_rate,
            interval_requests,
            global_capacity: self.gate.global_pool().capacity(),
            identity_limit: self.gate.identity_limit(),
        };

        if decision == TuningDecision::Hold {
            debug!(
                memory = outcome.memory_usage_percent,
                threads = outcome.thread_count,
                rejection_rate = outcome.rejection_rate,
                active = stats.current_active_requests,
                "tuning cycle: holding limits"
            );
        } else {
            info!(
                %decision,
                memory = outcome.memory_usage_percent,
                threads = outcome.thread_count,
                rejection_rate = outcome.rejection_rate,
                global_capacity = outcome.global_capacity,
                identity_limit = outcome.identity_limit,
                "tuning cycle: limits adjusted"
            );
        }

        Ok(outcome)
    }
}
