//! Periodic background tasks
//!
//! The tuner, the idle identity reaper and the rate-limit sweeper each run on
//! their own fixed period. A failed or panicking cycle is logged and counted,
//! and the task carries on with the next period. All tasks stop when the
//! shutdown channel flips to `true`; permits held by requests are unaffected.

use crate::config::Config;
use crate::metrics::{Metrics, TaskKind};
use permitgate::{AdmissionGate, DynamicTuner, GateError, IdleReaper, LoadSignals, RateLimiter};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{error, info, warn};

/// Handles to the running background tasks
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Start every background task the configuration enables
    pub fn start(
        config: &Config,
        gate: Arc<AdmissionGate>,
        limiter: Arc<RateLimiter>,
        signals: Arc<dyn LoadSignals>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let mut handles = Vec::with_capacity(3);

        if config.tuning.enabled {
            let tuner = Arc::new(DynamicTuner::new(
                Arc::clone(&gate),
                signals,
                config.tuning.policy,
            ));
            handles.push(spawn_tuner(
                tuner,
                config.tuning.interval,
                Arc::clone(&metrics),
                shutdown.subscribe(),
            ));
        } else {
            info!("Dynamic tuning disabled");
        }

        let reaper = IdleReaper::new(gate, config.reaper.idle_timeout);
        handles.push(spawn_reaper(
            reaper,
            config.reaper.interval,
            Arc::clone(&metrics),
            shutdown.subscribe(),
        ));

        handles.push(spawn_rate_limit_sweeper(
            limiter,
            config.rate_limit.sweep_interval,
            metrics,
            shutdown.subscribe(),
        ));

        Self { shutdown, handles }
    }

    /// A receiver that observes the same shutdown signal as the tasks
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Signal every task to stop and wait for them to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Background task ended abnormally: {}", e);
            }
        }
    }
}

/// Run `cycle` every `period` until shutdown
///
/// The first cycle runs one full period after start.
pub fn spawn_periodic<F>(
    kind: TaskKind,
    period: Duration,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
    mut cycle: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Result<(), GateError> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(task = kind.name(), period_secs = period.as_secs(), "Background task started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let result = catch_unwind(AssertUnwindSafe(&mut cycle))
                        .unwrap_or_else(|panic| Err(cycle_error(kind, panic_message(&*panic))));
                    if let Err(e) = &result {
                        warn!(task = kind.name(), error = %e, "Cycle failed, retrying next period");
                    }
                    metrics.record_cycle(kind, result.is_ok());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(task = kind.name(), "Background task stopped");
    })
}

pub fn spawn_tuner(
    tuner: Arc<DynamicTuner>,
    period: Duration,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let recorder = Arc::clone(&metrics);
    spawn_periodic(TaskKind::Tuner, period, metrics, shutdown, move || {
        let outcome = tuner.tick()?;
        recorder.record_tuning(&outcome);
        Ok(())
    })
}

pub fn spawn_reaper(
    reaper: IdleReaper,
    period: Duration,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let recorder = Arc::clone(&metrics);
    spawn_periodic(TaskKind::Reaper, period, metrics, shutdown, move || {
        let removed = reaper.sweep_at(Instant::now().into_std());
        recorder
            .identities_reaped
            .fetch_add(removed as u64, Ordering::Relaxed);
        Ok(())
    })
}

pub fn spawn_rate_limit_sweeper(
    limiter: Arc<RateLimiter>,
    period: Duration,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let recorder = Arc::clone(&metrics);
    spawn_periodic(
        TaskKind::RateLimitSweeper,
        period,
        metrics,
        shutdown,
        move || {
            let removed = limiter.evict_idle(Instant::now().into_std());
            recorder
                .rate_limit_keys_evicted
                .fetch_add(removed as u64, Ordering::Relaxed);
            Ok(())
        },
    )
}

fn cycle_error(kind: TaskKind, message: String) -> GateError {
    match kind {
        TaskKind::Tuner => GateError::TunerCycle(message),
        TaskKind::Reaper | TaskKind::RateLimitSweeper => GateError::ReaperCycle(message),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
