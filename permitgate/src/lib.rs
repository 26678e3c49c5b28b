//! # permitgate
//!
//! Admission control for services that front a shared, rate-limited
//! inference provider (LLM chat, speech-to-text, text-to-speech).
//!
//! ## Overview
//!
//! Every request is checked at three granularities at once, and is either
//! admitted or turned away immediately:
//! - **Global**: a cap on everything in flight
//! - **Request type**: a cap per class of work (`llm`, `streaming`, `asr`, `tts`)
//! - **Identity**: a cap per calling user, so no single caller can take the
//!   whole budget
//!
//! Pool capacities are resized at runtime from memory pressure and the recent
//! rejection rate, and per-identity state is reclaimed once it goes idle.
//! A separate fixed-window limiter bounds how *often* a key may call.
//!
//! ## Quick Start
//!
//! ```
//! use permitgate::AdmissionGate;
//! use std::sync::Arc;
//!
//! let gate = Arc::new(AdmissionGate::builder().build()?);
//!
//! match gate.admit("user:123", "llm") {
//!     Ok(permit) => {
//!         // Call the upstream provider while holding the permit.
//!         // Dropping it releases every level.
//!         drop(permit);
//!     }
//!     Err(e) => println!("Service busy, retry later: {e}"),
//! }
//! # Ok::<(), permitgate::GateError>(())
//! ```
//!
//! ## Components
//!
//! ### [`AdmissionGate`]
//! Composes the global, type and identity [`PermitPool`]s into one
//! acquire/release protocol. [`AdmissionGate::admit`] returns an
//! [`AdmissionPermit`] that releases exactly once when dropped.
//!
//! ### [`RateLimiter`]
//! Fixed window plus a minimum spacing between calls, keyed by user or IP.
//!
//! ```
//! use permitgate::{RateLimitConfig, RateLimitKey, RateLimiter};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! let key = RateLimitKey::Ip("203.0.113.7".into());
//!
//! assert!(limiter.is_allowed(&key.to_string()));
//! assert_eq!(limiter.remaining(&key.to_string()), 29);
//! ```
//!
//! ### [`DynamicTuner`]
//! One call to [`DynamicTuner::tick`] reads a [`LoadSnapshot`] and resizes
//! every pool within its bounds.
//!
//! ```
//! use permitgate::{
//!     AdmissionGate, DynamicTuner, GateError, LoadSignals, LoadSnapshot, TuningDecision,
//!     TuningPolicy,
//! };
//! use std::sync::Arc;
//!
//! struct HighMemory;
//!
//! impl LoadSignals for HighMemory {
//!     fn snapshot(&self) -> Result<LoadSnapshot, GateError> {
//!         Ok(LoadSnapshot { memory_usage_percent: 92.0, thread_count: 8 })
//!     }
//! }
//!
//! let gate = Arc::new(AdmissionGate::builder().build()?);
//! let tuner = DynamicTuner::new(Arc::clone(&gate), Arc::new(HighMemory), TuningPolicy::default());
//!
//! let outcome = tuner.tick()?;
//! assert_eq!(outcome.decision, TuningDecision::Shrink);
//! assert_eq!(gate.global_pool().capacity(), 80);
//! # Ok::<(), permitgate::GateError>(())
//! ```
//!
//! ### [`IdleReaper`]
//! Drops identities that are idle past a threshold and have nothing in flight.
//!
//! ### [`StatsReporter`]
//! Read-only snapshots of every counter and pool, ready to serialize.
//!
//! ## Scheduling
//!
//! The library is synchronous and owns no threads. Tuning, reaping and
//! rate-limit eviction are single calls meant to be driven by the host's own
//! periodic tasks.

pub mod core;

pub use core::{
    AdmissionGate, AdmissionGateBuilder, AdmissionPermit, AdmissionStats, DynamicTuner,
    GateError, IdentityStats, IdleReaper, LoadSignals, LoadSnapshot, MonitoringReport,
    PermitPool, PoolBounds, PoolScope, PoolStats, RateLimitConfig, RateLimitConfigBuilder,
    RateLimitKey, RateLimitReason, RateLimiter, RateLimiterStats, StatsReporter,
    TuningDecision, TuningOutcome, TuningPolicy, TuningPolicyBuilder,
};
pub use core::gate::{DEFAULT_GLOBAL_BOUNDS, DEFAULT_IDENTITY_BOUNDS};
