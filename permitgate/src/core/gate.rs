//! Multi-level admission gate
//!
//! An [`AdmissionGate`] admits a request only if a permit is free at every
//! level that applies to it:
//!
//! 1. the global pool,
//! 2. the pool for its request type (types without a pool skip this level),
//! 3. the pool of the calling identity, created on first use.
//!
//! Each step is undone if a later one fails, so a rejected request leaves no
//! permit behind. Admission never waits: a full pool rejects immediately.
//!
//! The identity map is guarded by a single mutex. Creating an identity,
//! taking its permit, and bumping its active count happen under that lock, so
//! the reaper can never observe an identity between "permit taken" and
//! "counted as active".

use super::pool::{PermitPool, PoolBounds};
use super::stats::{AdmissionStats, IdentityStats};
use super::{GateError, PoolScope};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[cfg(feature = "ahash")]
use ahash::AHashMap as HashMap;
#[cfg(not(feature = "ahash"))]
use std::collections::HashMap;

/// Default global pool: 100 permits, tunable within 50..=200
pub const DEFAULT_GLOBAL_BOUNDS: PoolBounds = PoolBounds::new(100, 50, 200);
/// Default per-identity pool: 5 permits, tunable within 3..=10
pub const DEFAULT_IDENTITY_BOUNDS: PoolBounds = PoolBounds::new(5, 3, 10);

const DEFAULT_TYPE_POOLS: [(&str, PoolBounds); 4] = [
    ("llm", PoolBounds::new(50, 25, 100)),
    ("streaming", PoolBounds::new(30, 15, 60)),
    ("asr", PoolBounds::new(20, 10, 40)),
    ("tts", PoolBounds::new(20, 10, 40)),
];

const DEFAULT_TYPE_ALIASES: [(&str, &str); 2] = [("chat", "llm"), ("stream", "streaming")];

struct IdentityState {
    pool: PermitPool,
    active: usize,
    last_activity: Instant,
    total_requests: u64,
}

impl IdentityState {
    fn new(identity: &str, capacity: usize, bounds: PoolBounds, now: Instant) -> Self {
        IdentityState {
            pool: PermitPool::with_capacity(format!("identity:{identity}"), capacity, bounds),
            active: 0,
            last_activity: now,
            total_requests: 0,
        }
    }
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    rejected: AtomicU64,
    rejected_global: AtomicU64,
    rejected_type: AtomicU64,
    rejected_identity: AtomicU64,
    anomalies: AtomicU64,
    active: AtomicUsize,
}

/// Admission control over global, per-type and per-identity permit pools
///
/// The gate is meant to be created once, shared behind an [`Arc`], and live
/// for the whole process.
///
/// # Example
///
/// ```
/// use permitgate::{AdmissionGate, PoolBounds};
/// use std::sync::Arc;
///
/// let gate = Arc::new(
///     AdmissionGate::builder()
///         .global(PoolBounds::fixed(10))
///         .identity(PoolBounds::fixed(1))
///         .build()?,
/// );
///
/// let permit = gate.admit("user:1", "llm")?;
/// assert!(gate.admit("user:1", "llm").is_err());
///
/// drop(permit);
/// assert!(gate.admit("user:1", "llm").is_ok());
/// # Ok::<(), permitgate::GateError>(())
/// ```
pub struct AdmissionGate {
    global: PermitPool,
    types: HashMap<String, PermitPool>,
    aliases: HashMap<String, String>,
    identity_bounds: PoolBounds,
    identity_limit: AtomicUsize,
    identities: Mutex<HashMap<String, IdentityState>>,
    counters: Counters,
}

impl AdmissionGate {
    /// Create a builder preloaded with the default pools
    ///
    /// Defaults: global 100 (50..=200), `llm` 50 (25..=100), `streaming` 30
    /// (15..=60), `asr` and `tts` 20 (10..=40), identity 5 (3..=10), with
    /// `chat` aliased to `llm` and `stream` to `streaming`.
    pub fn builder() -> AdmissionGateBuilder {
        AdmissionGateBuilder::default()
    }

    /// Non-blocking acquire at every applicable level
    ///
    /// Returns `false` when any pool is exhausted. A `true` must be paired
    /// with exactly one [`release`](Self::release); prefer
    /// [`admit`](Self::admit), which pairs them automatically.
    pub fn acquire(&self, identity: &str, request_type: &str) -> bool {
        self.try_acquire_at(identity, request_type, Instant::now())
            .is_ok()
    }

    /// [`acquire`](Self::acquire) with an explicit clock, reporting which
    /// level rejected the request
    ///
    /// # Errors
    ///
    /// Returns [`GateError::OverCapacity`] naming the exhausted level.
    pub fn try_acquire_at(
        &self,
        identity: &str,
        request_type: &str,
        now: Instant,
    ) -> Result<(), GateError> {
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        if !self.global.try_acquire() {
            return Err(self.reject(PoolScope::Global, identity, request_type));
        }

        let type_pool = self.type_pool(request_type);
        if let Some(pool) = type_pool {
            if !pool.try_acquire() {
                self.give_back(&self.global);
                return Err(self.reject(PoolScope::Type, identity, request_type));
            }
        }

        {
            let mut identities = self.identities.lock();
            let limit = self.identity_limit.load(Ordering::Relaxed);
            let state = identities
                .entry(identity.to_owned())
                .or_insert_with(|| IdentityState::new(identity, limit, self.identity_bounds, now));

            if !state.pool.try_acquire() {
                drop(identities);
                if let Some(pool) = type_pool {
                    self.give_back(pool);
                }
                self.give_back(&self.global);
                return Err(self.reject(PoolScope::Identity, identity, request_type));
            }

            state.active += 1;
            state.last_activity = now;
            state.total_requests += 1;
        }

        let active = self.counters.active.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(identity, request_type, active, "admission granted");
        Ok(())
    }

    /// Acquire and wrap the result in a permit that releases itself on drop
    ///
    /// # Errors
    ///
    /// Returns [`GateError::OverCapacity`] naming the exhausted level.
    pub fn admit(
        self: &Arc<Self>,
        identity: &str,
        request_type: &str,
    ) -> Result<AdmissionPermit, GateError> {
        self.admit_at(identity, request_type, Instant::now())
    }

    /// [`admit`](Self::admit) with an explicit clock
    ///
    /// # Errors
    ///
    /// Returns [`GateError::OverCapacity`] naming the exhausted level.
    pub fn admit_at(
        self: &Arc<Self>,
        identity: &str,
        request_type: &str,
        now: Instant,
    ) -> Result<AdmissionPermit, GateError> {
        self.try_acquire_at(identity, request_type, now)?;
        Ok(AdmissionPermit {
            gate: Arc::clone(self),
            identity: identity.to_owned(),
            request_type: request_type.to_owned(),
        })
    }

    /// Give back the permits taken by a successful acquire
    ///
    /// Mismatched releases are logged and counted as accounting anomalies and
    /// never touch a counter that is already zero. The global and type pools
    /// are released even when the identity is no longer tracked.
    pub fn release(&self, identity: &str, request_type: &str) {
        {
            let mut identities = self.identities.lock();
            match identities.get_mut(identity) {
                Some(state) if state.active > 0 => {
                    state.active -= 1;
                    if let Err(e) = state.pool.release() {
                        self.note_anomaly(e);
                    }
                }
                Some(_) => self.note_anomaly(GateError::AccountingAnomaly {
                    pool: format!("identity:{identity}"),
                    detail: "release with no active requests".into(),
                }),
                None => self.note_anomaly(GateError::AccountingAnomaly {
                    pool: format!("identity:{identity}"),
                    detail: "release for an identity that is not tracked".into(),
                }),
            }
        }

        if let Some(pool) = self.type_pool(request_type) {
            self.give_back(pool);
        }
        self.give_back(&self.global);

        let decremented = self
            .counters
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match decremented {
            Ok(previous) => debug!(
                identity,
                request_type,
                active = previous - 1,
                "admission released"
            ),
            Err(_) => self.note_anomaly(GateError::AccountingAnomaly {
                pool: "global".into(),
                detail: "release with no active requests".into(),
            }),
        }
    }

    /// The pool guarding `request_type`, if that type is limited
    ///
    /// Matching is case-insensitive and follows the configured aliases.
    pub fn type_pool(&self, request_type: &str) -> Option<&PermitPool> {
        if let Some(pool) = self.types.get(request_type) {
            return Some(pool);
        }
        let normalized = request_type.to_ascii_lowercase();
        let name = self.aliases.get(&normalized).unwrap_or(&normalized);
        self.types.get(name)
    }

    pub fn global_pool(&self) -> &PermitPool {
        &self.global
    }

    /// Capacity given to identity pools created from now on
    pub fn identity_limit(&self) -> usize {
        self.identity_limit.load(Ordering::Relaxed)
    }

    pub fn identity_bounds(&self) -> PoolBounds {
        self.identity_bounds
    }

    /// Scale every pool by `factor`, each within its own bounds
    ///
    /// Existing identity pools are resized along with the limit used for new
    /// identities.
    pub fn scale_pools(&self, factor: f64) {
        self.global.scale(factor);
        for pool in self.types.values() {
            pool.scale(factor);
        }

        let current = self.identity_limit.load(Ordering::Relaxed);
        let limit = self.identity_bounds.scaled(current, factor);
        self.identity_limit.store(limit, Ordering::Relaxed);

        let identities = self.identities.lock();
        for state in identities.values() {
            state.pool.resize(limit);
        }
    }

    /// Drop identities idle for longer than `idle_threshold` with nothing in
    /// flight. Returns how many were removed.
    pub fn reap_idle(&self, now: Instant, idle_threshold: Duration) -> usize {
        let mut identities = self.identities.lock();
        let before = identities.len();
        identities.retain(|identity, state| {
            let idle = now.saturating_duration_since(state.last_activity) > idle_threshold;
            let evict = idle && state.active == 0;
            if evict {
                debug!(identity = identity.as_str(), "evicting idle identity");
            }
            !evict
        });
        let removed = before - identities.len();
        if removed > 0 {
            info!(
                removed,
                remaining = identities.len(),
                "reaped idle identities"
            );
        }
        removed
    }

    pub fn stats(&self) -> AdmissionStats {
        let total_requests = self.counters.total.load(Ordering::Relaxed);
        let rejected_requests = self.counters.rejected.load(Ordering::Relaxed);
        let rejection_rate = if total_requests > 0 {
            rejected_requests as f64 / total_requests as f64
        } else {
            0.0
        };

        AdmissionStats {
            total_requests,
            rejected_requests,
            rejected_global: self.counters.rejected_global.load(Ordering::Relaxed),
            rejected_type: self.counters.rejected_type.load(Ordering::Relaxed),
            rejected_identity: self.counters.rejected_identity.load(Ordering::Relaxed),
            current_active_requests: self.counters.active.load(Ordering::Acquire),
            accounting_anomalies: self.counters.anomalies.load(Ordering::Relaxed),
            rejection_rate,
            active_identities: self.identities.lock().len(),
            identity_limit: self.identity_limit(),
            global: self.global.stats(),
            types: self
                .types
                .iter()
                .map(|(name, pool)| (name.clone(), pool.stats()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    /// Per-identity snapshot, sorted by identity
    pub fn identity_stats(&self, now: Instant) -> Vec<IdentityStats> {
        let identities = self.identities.lock();
        let mut stats: Vec<IdentityStats> = identities
            .iter()
            .map(|(identity, state)| IdentityStats {
                identity: identity.clone(),
                capacity: state.pool.capacity(),
                available: state.pool.available(),
                active: state.active,
                total_requests: state.total_requests,
                idle_secs: now.saturating_duration_since(state.last_activity).as_secs(),
            })
            .collect();
        stats.sort_by(|a, b| a.identity.cmp(&b.identity));
        stats
    }

    fn reject(&self, scope: PoolScope, identity: &str, request_type: &str) -> GateError {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        let per_scope = match scope {
            PoolScope::Global => &self.counters.rejected_global,
            PoolScope::Type => &self.counters.rejected_type,
            PoolScope::Identity => &self.counters.rejected_identity,
        };
        per_scope.fetch_add(1, Ordering::Relaxed);
        warn!(identity, request_type, %scope, "admission rejected");
        GateError::OverCapacity { scope }
    }

    fn give_back(&self, pool: &PermitPool) {
        if let Err(e) = pool.release() {
            self.note_anomaly(e);
        }
    }

    fn note_anomaly(&self, error: GateError) {
        self.counters.anomalies.fetch_add(1, Ordering::Relaxed);
        warn!(error = %error, "permit accounting anomaly");
    }
}

/// A granted admission that is released exactly once, when dropped
///
/// Holding the permit for the whole guarded operation (including the full
/// lifetime of a streamed response) keeps the slot occupied. Dropping it on
/// any path, including a cancelled future, returns every permit it holds.
#[must_use = "dropping an AdmissionPermit releases it immediately"]
pub struct AdmissionPermit {
    gate: Arc<AdmissionGate>,
    identity: String,
    request_type: String,
}

impl AdmissionPermit {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn request_type(&self) -> &str {
        &self.request_type
    }

    /// Release now instead of at the end of scope
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.gate.release(&self.identity, &self.request_type);
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("identity", &self.identity)
            .field("request_type", &self.request_type)
            .finish()
    }
}

/// Builder for configuring an AdmissionGate
///
/// # Example
///
/// ```
/// use permitgate::{AdmissionGate, PoolBounds};
///
/// let gate = AdmissionGate::builder()
///     .global(PoolBounds::new(200, 100, 400))
///     .type_pool("llm", PoolBounds::new(80, 40, 160))
///     .alias("completion", "llm")
///     .identity(PoolBounds::new(4, 2, 8))
///     .build()?;
///
/// assert!(gate.type_pool("Completion").is_some());
/// assert!(gate.type_pool("normal").is_none());
/// # Ok::<(), permitgate::GateError>(())
/// ```
pub struct AdmissionGateBuilder {
    global: PoolBounds,
    types: BTreeMap<String, PoolBounds>,
    aliases: BTreeMap<String, String>,
    identity: PoolBounds,
}

impl Default for AdmissionGateBuilder {
    fn default() -> Self {
        Self {
            global: DEFAULT_GLOBAL_BOUNDS,
            types: DEFAULT_TYPE_POOLS
                .iter()
                .map(|(name, bounds)| ((*name).to_owned(), *bounds))
                .collect(),
            aliases: DEFAULT_TYPE_ALIASES
                .iter()
                .map(|(from, to)| ((*from).to_owned(), (*to).to_owned()))
                .collect(),
            identity: DEFAULT_IDENTITY_BOUNDS,
        }
    }
}

impl AdmissionGateBuilder {
    /// Set the global pool bounds
    pub fn global(mut self, bounds: PoolBounds) -> Self {
        self.global = bounds;
        self
    }

    /// Add or replace the pool for a request type
    pub fn type_pool(mut self, name: &str, bounds: PoolBounds) -> Self {
        self.types.insert(name.to_ascii_lowercase(), bounds);
        self
    }

    /// Remove every type pool and alias, including the defaults
    pub fn clear_type_pools(mut self) -> Self {
        self.types.clear();
        self.aliases.clear();
        self
    }

    /// Route request type `from` to the pool of `to`
    pub fn alias(mut self, from: &str, to: &str) -> Self {
        self.aliases
            .insert(from.to_ascii_lowercase(), to.to_ascii_lowercase());
        self
    }

    /// Set the per-identity pool bounds
    pub fn identity(mut self, bounds: PoolBounds) -> Self {
        self.identity = bounds;
        self
    }

    /// Validate the bounds and build the gate
    ///
    /// # Errors
    ///
    /// Returns [`GateError::InvalidConfig`] for inconsistent bounds or an
    /// alias pointing at an unknown type.
    pub fn build(self) -> Result<AdmissionGate, GateError> {
        self.global.validate("global")?;
        self.identity.validate("identity")?;
        for (name, bounds) in &self.types {
            bounds.validate(name)?;
        }
        for (from, to) in &self.aliases {
            if !self.types.contains_key(to) {
                return Err(GateError::InvalidConfig(format!(
                    "alias {from} points at unknown request type {to}"
                )));
            }
        }

        Ok(AdmissionGate {
            global: PermitPool::new("global", self.global),
            types: self
                .types
                .into_iter()
                .map(|(name, bounds)| {
                    let pool = PermitPool::new(name.clone(), bounds);
                    (name, pool)
                })
                .collect(),
            aliases: self.aliases.into_iter().collect(),
            identity_bounds: self.identity,
            identity_limit: AtomicUsize::new(self.identity.initial),
            identities: Mutex::new(HashMap::default()),
            counters: Counters::default(),
        })
    }
}
