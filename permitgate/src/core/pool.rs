//! Resizable permit pools
//!
//! A [`PermitPool`] is a non-blocking counting semaphore whose capacity can be
//! changed while permits are outstanding. Growing hands out new permits
//! immediately. Shrinking is cooperative: it takes back whatever is free right
//! now and records the rest as a debt that in-flight permits pay off when they
//! are released. At no point can more permits be outstanding than the pool's
//! capacity plus the debt that is still being paid down.

use super::GateError;
use super::stats::PoolStats;
use parking_lot::Mutex;
use serde::Serialize;

// Absorbs float noise such as 100.0 * 1.1 == 110.00000000000001
const SCALE_EPSILON: f64 = 1e-9;

/// Initial size and tuning range of a pool
///
/// # Example
///
/// ```
/// use permitgate::PoolBounds;
///
/// let bounds = PoolBounds::new(100, 50, 200);
/// assert_eq!(bounds.scaled(100, 0.8), 80);
/// assert_eq!(bounds.scaled(190, 1.1), 200);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolBounds {
    /// Capacity the pool starts with
    pub initial: usize,
    /// Smallest capacity the tuner may shrink to
    pub floor: usize,
    /// Largest capacity the tuner may grow to
    pub ceiling: usize,
}

impl PoolBounds {
    pub const fn new(initial: usize, floor: usize, ceiling: usize) -> Self {
        Self {
            initial,
            floor,
            ceiling,
        }
    }

    /// Bounds that never move from `capacity`
    pub const fn fixed(capacity: usize) -> Self {
        Self::new(capacity, capacity, capacity)
    }

    /// Check `0 < ceiling` and `floor <= initial <= ceiling`
    ///
    /// # Errors
    ///
    /// Returns [`GateError::InvalidConfig`] naming the offending pool.
    pub fn validate(&self, name: &str) -> Result<(), GateError> {
        if self.ceiling == 0 {
            return Err(GateError::InvalidConfig(format!(
                "{name}: ceiling must be greater than zero"
            )));
        }
        if self.floor > self.initial || self.initial > self.ceiling {
            return Err(GateError::InvalidConfig(format!(
                "{name}: expected floor <= initial <= ceiling, got {} <= {} <= {}",
                self.floor, self.initial, self.ceiling
            )));
        }
        Ok(())
    }

    /// Clamp a capacity into `[floor, ceiling]`
    pub fn clamp(&self, capacity: usize) -> usize {
        capacity.clamp(self.floor, self.ceiling.max(self.floor))
    }

    /// `⌈current × factor⌉`, clamped into `[floor, ceiling]`
    ///
    /// A shrink always moves at least one permit while above the floor, so
    /// small pools still reach it.
    pub fn scaled(&self, current: usize, factor: f64) -> usize {
        let raw = (current as f64 * factor - SCALE_EPSILON).ceil();
        let mut target = if raw <= 0.0 { 0 } else { raw as usize };
        if factor < 1.0 && current > self.floor {
            target = target.min(current - 1);
        }
        self.clamp(target)
    }
}

#[derive(Debug)]
struct PoolState {
    capacity: usize,
    available: usize,
    // Permits still owed to a past shrink
    debt: usize,
}

impl PoolState {
    fn in_use(&self) -> usize {
        (self.capacity + self.debt).saturating_sub(self.available)
    }
}

/// A non-blocking counting semaphore with live resizing
///
/// # Example
///
/// ```
/// use permitgate::{PermitPool, PoolBounds};
///
/// let pool = PermitPool::new("llm", PoolBounds::new(2, 1, 4));
/// assert!(pool.try_acquire());
/// assert!(pool.try_acquire());
/// assert!(!pool.try_acquire());
///
/// pool.release().unwrap();
/// assert_eq!(pool.available(), 1);
/// ```
#[derive(Debug)]
pub struct PermitPool {
    name: String,
    bounds: PoolBounds,
    state: Mutex<PoolState>,
}

impl PermitPool {
    /// Create a pool at `bounds.initial` (clamped into the bounds)
    pub fn new(name: impl Into<String>, bounds: PoolBounds) -> Self {
        Self::with_capacity(name, bounds.initial, bounds)
    }

    /// Create a pool at an explicit capacity, clamped into `bounds`
    pub fn with_capacity(name: impl Into<String>, capacity: usize, bounds: PoolBounds) -> Self {
        let capacity = bounds.clamp(capacity);
        PermitPool {
            name: name.into(),
            bounds,
            state: Mutex::new(PoolState {
                capacity,
                available: capacity,
                debt: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bounds(&self) -> PoolBounds {
        self.bounds
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn available(&self) -> usize {
        self.state.lock().available
    }

    /// Permits currently held by callers
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use()
    }

    /// Take one permit if any is free. Never blocks.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.available == 0 {
            return false;
        }
        state.available -= 1;
        true
    }

    /// Return one permit
    ///
    /// A permit returned while a shrink is still being absorbed pays down that
    /// debt instead of becoming available again.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::AccountingAnomaly`] when the pool is already full,
    /// i.e. the release has no matching acquire. The pool is left unchanged.
    pub fn release(&self) -> Result<(), GateError> {
        let mut state = self.state.lock();
        if state.debt > 0 {
            state.debt -= 1;
            return Ok(());
        }
        if state.available >= state.capacity {
            return Err(GateError::AccountingAnomaly {
                pool: self.name.clone(),
                detail: format!(
                    "release with all {} permits already available",
                    state.capacity
                ),
            });
        }
        state.available += 1;
        Ok(())
    }

    /// Move the capacity to `new_capacity` (clamped into the bounds)
    ///
    /// Returns the capacity actually applied.
    pub fn resize(&self, new_capacity: usize) -> usize {
        let mut state = self.state.lock();
        self.apply_resize(&mut state, new_capacity)
    }

    /// Resize to `⌈capacity × factor⌉` within the bounds
    pub fn scale(&self, factor: f64) -> usize {
        let mut state = self.state.lock();
        let target = self.bounds.scaled(state.capacity, factor);
        self.apply_resize(&mut state, target)
    }

    fn apply_resize(&self, state: &mut PoolState, new_capacity: usize) -> usize {
        let target = self.bounds.clamp(new_capacity);

        if target > state.capacity {
            let delta = target - state.capacity;
            // Growth first cancels any outstanding shrink
            let absorbed = delta.min(state.debt);
            state.debt -= absorbed;
            state.available += delta - absorbed;
        } else if target < state.capacity {
            let delta = state.capacity - target;
            let reclaimed = delta.min(state.available);
            state.available -= reclaimed;
            state.debt += delta - reclaimed;
        }
        state.capacity = target;
        target
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            name: self.name.clone(),
            capacity: state.capacity,
            available: state.available,
            in_use: state.in_use(),
            floor: self.bounds.floor,
            ceiling: self.bounds.ceiling,
        }
    }
}
