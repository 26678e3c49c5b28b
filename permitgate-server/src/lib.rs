//! # permitgate server
//!
//! Runs the permitgate admission gate in front of an inference service
//! (LLM, streaming, ASR and TTS requests) and keeps it healthy over time.
//!
//! ## What It Adds to the Library
//!
//! - **Dynamic tuning**: a periodic task reads memory pressure and the recent
//!   rejection rate, then shrinks or grows every pool within its bounds
//! - **Idle reaping**: identities with no active requests are forgotten after
//!   an idle timeout
//! - **Rate-limit sweeping**: idle per-user and per-IP rate limit state is
//!   evicted
//! - **Guards**: [`guard::AdmissionGuard`] wraps upstream calls and streamed
//!   responses so permits are released on completion, error, timeout or
//!   cancellation
//! - **Monitoring**: optional `/health`, `/stats`, `/stats/identities` and
//!   `/metrics` endpoints
//!
//! ## Quick Start
//!
//! ```bash
//! # Show all available options
//! permitgate --help
//!
//! # Defaults, with monitoring on port 9090
//! permitgate --monitor
//!
//! # Larger global pool, tighter per-identity limit
//! permitgate --global-concurrency 200 --global-ceiling 400 --identity-concurrency 3
//!
//! # Custom request types
//! permitgate --type-limit llm=80:40:160 --type-limit embeddings=40 --type-alias chat=llm
//! ```
//!
//! ## Configuration
//!
//! Configure via CLI arguments or environment variables (CLI takes precedence):
//!
//! ```bash
//! export PERMITGATE_GLOBAL_CONCURRENCY=150
//! export PERMITGATE_TUNING_INTERVAL_SECS=15
//! export PERMITGATE_MONITOR=true
//! permitgate
//!
//! # List all available environment variables
//! permitgate --list-env-vars
//! ```
//!
//! ## Architecture
//!
//! ```text
//!   request ──▶ RateLimiter ──▶ AdmissionGate ──▶ upstream call / stream
//!                                  ▲     ▲
//!            ┌─────────────────────┘     └──────────────┐
//!      ┌─────┴─────┐                              ┌─────┴─────┐
//!      │   Tuner   │◀── SystemProbe               │  Reaper   │
//!      └───────────┘                              └───────────┘
//! ```
//!
//! The background tasks never hold a permit and never block admission for
//! longer than one short critical section.

pub mod config;
pub mod guard;
pub mod metrics;
pub mod monitor;
pub mod probe;
pub mod tasks;
