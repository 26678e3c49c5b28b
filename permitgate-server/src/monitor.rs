//! HTTP monitoring endpoints
//!
//! # API Endpoints
//!
//! ## GET /health
//!
//! Returns "OK" with 200 status.
//!
//! ## GET /stats
//!
//! Admission and rate limiter counters plus background task counters:
//!
//! ```json
//! {
//!   "admission": {
//!     "total_requests": 1200,
//!     "rejected_requests": 14,
//!     "current_active_requests": 37,
//!     "global": { "name": "global", "capacity": 100, "available": 63, ... },
//!     "types": { "llm": { ... }, "streaming": { ... } },
//!     ...
//!   },
//!   "rate_limiter": { "tracked_keys": 52, ... },
//!   "tasks": { "tuner_cycles": 40, "tuner_failures": 0, ... }
//! }
//! ```
//!
//! ## GET /stats/identities
//!
//! One entry per tracked identity, sorted by identity.
//!
//! ## GET /metrics
//!
//! The same numbers in Prometheus text format.

use crate::config::MonitorConfig;
use crate::metrics::{Metrics, MetricsSnapshot};
use anyhow::{Context, Result};
use axum::{
    Router,
    extract::State,
    http::header,
    response::{IntoResponse, Json},
    routing::get,
};
use permitgate::{IdentityStats, MonitoringReport, StatsReporter};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub struct MonitorState {
    pub reporter: StatsReporter,
    pub metrics: Arc<Metrics>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub report: MonitoringReport,
    pub tasks: MetricsSnapshot,
}

pub fn router(state: Arc<MonitorState>) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/stats", get(handle_stats))
        .route("/stats/identities", get(handle_identities))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

pub async fn bind(config: &MonitorConfig) -> Result<TcpListener> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind monitoring endpoint on {addr}"))?;
    tracing::info!("Monitoring endpoint listening on {}", addr);
    Ok(listener)
}

/// Serve `app` until the shutdown channel flips to `true`
pub async fn serve(
    listener: TcpListener,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    tracing::info!("Monitoring endpoint stopped");
    Ok(())
}

async fn handle_stats(State(state): State<Arc<MonitorState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        report: state.reporter.report(),
        tasks: state.metrics.snapshot(),
    })
}

async fn handle_identities(State(state): State<Arc<MonitorState>>) -> Json<Vec<IdentityStats>> {
    Json(state.reporter.identities())
}

async fn handle_metrics(State(state): State<Arc<MonitorState>>) -> impl IntoResponse {
    let body = state.metrics.export_prometheus(&state.reporter.report());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
