//! Read-only snapshots for monitoring
//!
//! Every type here is a plain serializable value. Taking a snapshot never
//! mutates the gate or the limiter.

use super::gate::AdmissionGate;
use super::rate_limiter::RateLimiter;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// State of a single permit pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub capacity: usize,
    pub available: usize,
    pub in_use: usize,
    pub floor: usize,
    pub ceiling: usize,
}

/// Gate-wide counters and pool states
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStats {
    pub total_requests: u64,
    pub rejected_requests: u64,
    pub rejected_global: u64,
    pub rejected_type: u64,
    pub rejected_identity: u64,
    pub current_active_requests: usize,
    pub accounting_anomalies: u64,
    /// `rejected_requests / total_requests`, or 0 before the first request
    pub rejection_rate: f64,
    pub active_identities: usize,
    /// Capacity given to newly created identity pools
    pub identity_limit: usize,
    pub global: PoolStats,
    pub types: BTreeMap<String, PoolStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityStats {
    pub identity: String,
    pub capacity: usize,
    pub available: usize,
    pub active: usize,
    pub total_requests: u64,
    pub idle_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimiterStats {
    pub tracked_keys: usize,
    pub allowed: u64,
    pub rejected_window: u64,
    pub rejected_spacing: u64,
    pub max_per_window: u32,
    pub window_secs: u64,
    pub min_spacing_ms: u64,
}

/// Everything the monitoring surface exposes in one value
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringReport {
    pub admission: AdmissionStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limiter: Option<RateLimiterStats>,
}

/// Builds monitoring reports from a live gate and, optionally, a limiter
#[derive(Clone)]
pub struct StatsReporter {
    gate: Arc<AdmissionGate>,
    limiter: Option<Arc<RateLimiter>>,
}

impl StatsReporter {
    pub fn new(gate: Arc<AdmissionGate>) -> Self {
        Self {
            gate,
            limiter: None,
        }
    }

    /// Include rate-limiter counters in every report
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn report(&self) -> MonitoringReport {
        MonitoringReport {
            admission: self.gate.stats(),
            rate_limiter: self.limiter.as_ref().map(|limiter| limiter.stats()),
        }
    }

    pub fn identities(&self) -> Vec<IdentityStats> {
        self.gate.identity_stats(Instant::now())
    }
}
