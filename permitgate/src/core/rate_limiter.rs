//! Fixed-window call-rate limiter with a minimum spacing between calls
//!
//! This module provides [`RateLimiter`], which is independent of the
//! admission gate: it bounds how *often* a key may call, not how many of its
//! calls may be in flight.
//!
//! For each key the limiter keeps a window start, a count of calls allowed in
//! that window, and the time of the last allowed call. A call is allowed when
//!
//! - the window has elapsed (the window restarts and the call is the first in
//!   it), or
//! - the window still has room and at least `min_spacing` has passed since the
//!   previous allowed call.
//!
//! Rejected calls never count against the window.

use super::stats::RateLimiterStats;
use super::{GateError, RateLimitReason};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

#[cfg(feature = "ahash")]
use ahash::AHashMap as HashMap;
#[cfg(not(feature = "ahash"))]
use std::collections::HashMap;

/// Who a rate-limit entry belongs to
///
/// Formats as `user:<id>` or `ip:<addr>`, so users and addresses never share
/// an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    User(String),
    Ip(String),
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitKey::User(id) => write!(f, "user:{id}"),
            RateLimitKey::Ip(addr) => write!(f, "ip:{addr}"),
        }
    }
}

/// Limits applied to every key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Calls allowed per window
    pub max_per_window: u32,
    /// Length of the fixed window
    pub window: Duration,
    /// Smallest gap between two allowed calls of one key
    pub min_spacing: Duration,
    /// Keys without an allowed call for this long are evicted by
    /// [`RateLimiter::evict_idle`]
    pub idle_eviction: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_window: 30,
            window: Duration::from_secs(60),
            min_spacing: Duration::from_millis(2000),
            idle_eviction: Duration::from_secs(3600),
        }
    }
}

impl RateLimitConfig {
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::default()
    }

    /// # Errors
    ///
    /// Returns [`GateError::InvalidConfig`] for a zero quota or window.
    pub fn validate(&self) -> Result<(), GateError> {
        if self.max_per_window == 0 {
            return Err(GateError::InvalidConfig(
                "rate limit: max_per_window must be greater than zero".into(),
            ));
        }
        if self.window.is_zero() {
            return Err(GateError::InvalidConfig(
                "rate limit: window must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`RateLimitConfig`]
///
/// # Example
///
/// ```
/// use permitgate::RateLimitConfig;
/// use std::time::Duration;
///
/// let config = RateLimitConfig::builder()
///     .max_per_window(10)
///     .window(Duration::from_secs(10))
///     .min_spacing(Duration::ZERO)
///     .build()?;
/// assert_eq!(config.max_per_window, 10);
/// # Ok::<(), permitgate::GateError>(())
/// ```
#[derive(Default)]
pub struct RateLimitConfigBuilder {
    config: RateLimitConfig,
}

impl RateLimitConfigBuilder {
    pub fn max_per_window(mut self, max: u32) -> Self {
        self.config.max_per_window = max;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.config.window = window;
        self
    }

    pub fn min_spacing(mut self, spacing: Duration) -> Self {
        self.config.min_spacing = spacing;
        self
    }

    pub fn idle_eviction(mut self, idle: Duration) -> Self {
        self.config.idle_eviction = idle;
        self
    }

    /// # Errors
    ///
    /// Returns [`GateError::InvalidConfig`] for a zero quota or window.
    pub fn build(self) -> Result<RateLimitConfig, GateError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[derive(Debug)]
struct RateLimitState {
    window_start: Instant,
    count: u32,
    // None right after a window reset, so the first call is never too soon
    last_request: Option<Instant>,
}

impl RateLimitState {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
            last_request: None,
        }
    }

    fn last_seen(&self) -> Instant {
        self.last_request.unwrap_or(self.window_start)
    }
}

#[derive(Default)]
struct Counters {
    allowed: AtomicU64,
    rejected_window: AtomicU64,
    rejected_spacing: AtomicU64,
}

/// Per-key fixed-window limiter
///
/// # Example
///
/// ```
/// use permitgate::{RateLimitConfig, RateLimitKey, RateLimiter};
/// use std::time::{Duration, Instant};
///
/// let limiter = RateLimiter::new(RateLimitConfig::default());
/// let key = RateLimitKey::User("42".into()).to_string();
/// let start = Instant::now();
///
/// assert!(limiter.check_at(&key, start).is_ok());
/// // Too soon after the previous call
/// assert!(limiter.check_at(&key, start + Duration::from_millis(500)).is_err());
/// assert!(limiter.check_at(&key, start + Duration::from_secs(2)).is_ok());
/// ```
pub struct RateLimiter {
    config: RateLimitConfig,
    entries: Mutex<HashMap<String, RateLimitState>>,
    counters: Counters,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiter {
            config,
            entries: Mutex::new(HashMap::default()),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Record a call from `key` if its limits allow it
    pub fn is_allowed(&self, key: &str) -> bool {
        self.check_at(key, Instant::now()).is_ok()
    }

    /// Like [`is_allowed`](Self::is_allowed), with the rejection reason
    ///
    /// # Errors
    ///
    /// Returns [`GateError::RateLimited`] with the rule that fired and how
    /// long until the call would be allowed.
    pub fn check(&self, key: &str) -> Result<(), GateError> {
        self.check_at(key, Instant::now())
    }

    /// [`check`](Self::check) with an explicit clock
    ///
    /// # Errors
    ///
    /// Returns [`GateError::RateLimited`] with the rule that fired and how
    /// long until the call would be allowed.
    pub fn check_at(&self, key: &str, now: Instant) -> Result<(), GateError> {
        let mut entries = self.entries.lock();
        let state = entries
            .entry(key.to_owned())
            .or_insert_with(|| RateLimitState::new(now));

        let window_end = state.window_start + self.config.window;
        if now >= window_end {
            trace!(key, "rate limit window reset");
            *state = RateLimitState::new(now);
        } else if state.count >= self.config.max_per_window {
            self.counters.rejected_window.fetch_add(1, Ordering::Relaxed);
            debug!(key, count = state.count, "rate limited: window quota exhausted");
            return Err(GateError::RateLimited {
                reason: RateLimitReason::WindowExhausted,
                retry_after: window_end - now,
            });
        } else if let Some(last) = state.last_request {
            let since_last = now.saturating_duration_since(last);
            if since_last < self.config.min_spacing {
                self.counters.rejected_spacing.fetch_add(1, Ordering::Relaxed);
                debug!(
                    key,
                    interval_ms = since_last.as_millis() as u64,
                    "rate limited: calls too close together"
                );
                return Err(GateError::RateLimited {
                    reason: RateLimitReason::TooSoon,
                    retry_after: self.config.min_spacing - since_last,
                });
            }
        }

        state.count += 1;
        state.last_request = Some(now);
        self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        trace!(key, count = state.count, "rate limit check passed");
        Ok(())
    }

    /// Calls `key` may still make in its current window
    pub fn remaining(&self, key: &str) -> u32 {
        self.remaining_at(key, Instant::now())
    }

    pub fn remaining_at(&self, key: &str, now: Instant) -> u32 {
        let entries = self.entries.lock();
        match entries.get(key) {
            Some(state) if now < state.window_start + self.config.window => {
                self.config.max_per_window.saturating_sub(state.count)
            }
            _ => self.config.max_per_window,
        }
    }

    /// Drop keys with no allowed call for longer than the configured idle
    /// period. Returns how many were removed.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let idle = self.config.idle_eviction;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, state| now.saturating_duration_since(state.last_seen()) <= idle);
        let removed = before - entries.len();
        if removed > 0 {
            info!(removed, remaining = entries.len(), "evicted idle rate limit entries");
        }
        removed
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            tracked_keys: self.len(),
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            rejected_window: self.counters.rejected_window.load(Ordering::Relaxed),
            rejected_spacing: self.counters.rejected_spacing.load(Ordering::Relaxed),
            max_per_window: self.config.max_per_window,
            window_secs: self.config.window.as_secs(),
            min_spacing_ms: self.config.min_spacing.as_millis() as u64,
        }
    }
}
