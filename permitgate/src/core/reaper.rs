//! Eviction of idle per-identity state

use super::gate::AdmissionGate;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Removes identities that have been idle past a threshold
///
/// An identity with requests in flight is never removed, however long ago
/// its last request started.
///
/// # Example
///
/// ```
/// use permitgate::{AdmissionGate, IdleReaper};
/// use std::sync::Arc;
/// use std::time::{Duration, Instant};
///
/// let gate = Arc::new(AdmissionGate::builder().build()?);
/// let start = Instant::now();
/// gate.try_acquire_at("user:1", "llm", start)?;
/// gate.release("user:1", "llm");
///
/// let reaper = IdleReaper::new(Arc::clone(&gate), Duration::from_secs(60));
/// assert_eq!(reaper.sweep_at(start + Duration::from_secs(30)), 0);
/// assert_eq!(reaper.sweep_at(start + Duration::from_secs(61)), 1);
/// # Ok::<(), permitgate::GateError>(())
/// ```
pub struct IdleReaper {
    gate: Arc<AdmissionGate>,
    idle_threshold: Duration,
}

impl IdleReaper {
    pub fn new(gate: Arc<AdmissionGate>, idle_threshold: Duration) -> Self {
        Self {
            gate,
            idle_threshold,
        }
    }

    pub fn idle_threshold(&self) -> Duration {
        self.idle_threshold
    }

    /// Run one sweep now. Returns the number of identities removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        self.gate.reap_idle(now, self.idle_threshold)
    }
}
