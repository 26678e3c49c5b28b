//! Simple metrics collection for observability
//!
//! Background loops and guards record into lock-free atomic counters. The
//! admission counters themselves live in the gate and are read through a
//! [`MonitoringReport`] at export time.

use permitgate::{MonitoringReport, PoolStats, TuningDecision, TuningOutcome};
use serde::Serialize;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Periodic tasks that report into [`Metrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Tuner,
    Reaper,
    RateLimitSweeper,
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Tuner => "tuner",
            TaskKind::Reaper => "reaper",
            TaskKind::RateLimitSweeper => "rate_limit_sweeper",
        }
    }
}

/// Cycle counters of one periodic task
#[derive(Debug, Default)]
pub struct TaskCounters {
    pub cycles: AtomicU64,
    pub failures: AtomicU64,
}

/// Counters collected by the server
pub struct Metrics {
    /// Server start time
    start_time: Instant,

    pub tuner: TaskCounters,
    pub reaper: TaskCounters,
    pub rate_limit_sweeper: TaskCounters,

    /// Tuning decisions
    pub tuner_shrinks: AtomicU64,
    pub tuner_grows: AtomicU64,
    pub tuner_holds: AtomicU64,

    /// Last load reading, memory stored as f64 bits
    last_memory_percent_bits: AtomicU64,
    pub last_thread_count: AtomicUsize,

    /// Evictions
    pub identities_reaped: AtomicU64,
    pub rate_limit_keys_evicted: AtomicU64,

    /// Guard outcomes
    pub calls_timed_out: AtomicU64,
    pub calls_failed: AtomicU64,
    pub streams_expired: AtomicU64,
}

/// Serializable copy of the task counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub tuner_cycles: u64,
    pub tuner_failures: u64,
    pub tuner_shrinks: u64,
    pub tuner_grows: u64,
    pub tuner_holds: u64,
    pub reaper_cycles: u64,
    pub reaper_failures: u64,
    pub rate_limit_sweeper_cycles: u64,
    pub rate_limit_sweeper_failures: u64,
    pub last_memory_percent: f64,
    pub last_thread_count: usize,
    pub identities_reaped: u64,
    pub rate_limit_keys_evicted: u64,
    pub calls_timed_out: u64,
    pub calls_failed: u64,
    pub streams_expired: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            tuner: TaskCounters::default(),
            reaper: TaskCounters::default(),
            rate_limit_sweeper: TaskCounters::default(),
            tuner_shrinks: AtomicU64::new(0),
            tuner_grows: AtomicU64::new(0),
            tuner_holds: AtomicU64::new(0),
            last_memory_percent_bits: AtomicU64::new(0f64.to_bits()),
            last_thread_count: AtomicUsize::new(0),
            identities_reaped: AtomicU64::new(0),
            rate_limit_keys_evicted: AtomicU64::new(0),
            calls_timed_out: AtomicU64::new(0),
            calls_failed: AtomicU64::new(0),
            streams_expired: AtomicU64::new(0),
        }
    }

    pub fn task(&self, kind: TaskKind) -> &TaskCounters {
        match kind {
            TaskKind::Tuner => &self.tuner,
            TaskKind::Reaper => &self.reaper,
            TaskKind::RateLimitSweeper => &self.rate_limit_sweeper,
        }
    }

    /// Record the end of one task cycle
    pub fn record_cycle(&self, kind: TaskKind, succeeded: bool) {
        let counters = self.task(kind);
        counters.cycles.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            counters.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_tuning(&self, outcome: &TuningOutcome) {
        let decisions = match outcome.decision {
            TuningDecision::Shrink => &self.tuner_shrinks,
            TuningDecision::Grow => &self.tuner_grows,
            TuningDecision::Hold => &self.tuner_holds,
        };
        decisions.fetch_add(1, Ordering::Relaxed);
        self.last_memory_percent_bits
            .store(outcome.memory_usage_percent.to_bits(), Ordering::Relaxed);
        self.last_thread_count
            .store(outcome.thread_count, Ordering::Relaxed);
    }

    pub fn last_memory_percent(&self) -> f64 {
        f64::from_bits(self.last_memory_percent_bits.load(Ordering::Relaxed))
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_seconds: self.uptime_seconds(),
            tuner_cycles: self.tuner.cycles.load(Ordering::Relaxed),
            tuner_failures: self.tuner.failures.load(Ordering::Relaxed),
            tuner_shrinks: self.tuner_shrinks.load(Ordering::Relaxed),
            tuner_grows: self.tuner_grows.load(Ordering::Relaxed),
            tuner_holds: self.tuner_holds.load(Ordering::Relaxed),
            reaper_cycles: self.reaper.cycles.load(Ordering::Relaxed),
            reaper_failures: self.reaper.failures.load(Ordering::Relaxed),
            rate_limit_sweeper_cycles: self.rate_limit_sweeper.cycles.load(Ordering::Relaxed),
            rate_limit_sweeper_failures: self.rate_limit_sweeper.failures.load(Ordering::Relaxed),
            last_memory_percent: self.last_memory_percent(),
            last_thread_count: self.last_thread_count.load(Ordering::Relaxed),
            identities_reaped: self.identities_reaped.load(Ordering::Relaxed),
            rate_limit_keys_evicted: self.rate_limit_keys_evicted.load(Ordering::Relaxed),
            calls_timed_out: self.calls_timed_out.load(Ordering::Relaxed),
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
            streams_expired: self.streams_expired.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self, report: &MonitoringReport) -> String {
        let mut output = String::with_capacity(4096);
        let admission = &report.admission;
        let tasks = self.snapshot();

        metric(
            &mut output,
            "permitgate_uptime_seconds",
            "Time since server start in seconds",
            "gauge",
            &[(None, tasks.uptime_seconds.to_string())],
        );

        // Admission decisions
        metric(
            &mut output,
            "permitgate_requests_total",
            "Total admission attempts",
            "counter",
            &[(None, admission.total_requests.to_string())],
        );
        metric(
            &mut output,
            "permitgate_requests_rejected",
            "Admission attempts rejected, by the level that rejected them",
            "counter",
            &[
                (Some("scope=\"global\""), admission.rejected_global.to_string()),
                (Some("scope=\"type\""), admission.rejected_type.to_string()),
                (
                    Some("scope=\"identity\""),
                    admission.rejected_identity.to_string(),
                ),
            ],
        );
        metric(
            &mut output,
            "permitgate_rejection_rate",
            "Rejected over total admission attempts since start",
            "gauge",
            &[(None, format!("{:.6}", admission.rejection_rate))],
        );
        metric(
            &mut output,
            "permitgate_requests_active",
            "Requests currently holding permits",
            "gauge",
            &[(None, admission.current_active_requests.to_string())],
        );
        metric(
            &mut output,
            "permitgate_accounting_anomalies",
            "Releases that did not match an acquire",
            "counter",
            &[(None, admission.accounting_anomalies.to_string())],
        );
        metric(
            &mut output,
            "permitgate_identities_active",
            "Identities currently tracked",
            "gauge",
            &[(None, admission.active_identities.to_string())],
        );
        metric(
            &mut output,
            "permitgate_identity_limit",
            "Concurrency given to each identity",
            "gauge",
            &[(None, admission.identity_limit.to_string())],
        );

        // Pools
        let pools: Vec<&PoolStats> = std::iter::once(&admission.global)
            .chain(admission.types.values())
            .collect();
        let pool_samples = |value: fn(&PoolStats) -> usize| {
            pools
                .iter()
                .map(|pool| {
                    (
                        Some(format!("pool=\"{}\"", pool.name)),
                        value(pool).to_string(),
                    )
                })
                .collect::<Vec<_>>()
        };
        metric_owned(
            &mut output,
            "permitgate_pool_capacity",
            "Current capacity of each permit pool",
            "gauge",
            &pool_samples(|pool| pool.capacity),
        );
        metric_owned(
            &mut output,
            "permitgate_pool_available",
            "Free permits in each pool",
            "gauge",
            &pool_samples(|pool| pool.available),
        );
        metric_owned(
            &mut output,
            "permitgate_pool_in_use",
            "Permits held in each pool",
            "gauge",
            &pool_samples(|pool| pool.in_use),
        );

        // Rate limiter
        if let Some(limiter) = &report.rate_limiter {
            metric(
                &mut output,
                "permitgate_rate_limit_keys",
                "Keys tracked by the rate limiter",
                "gauge",
                &[(None, limiter.tracked_keys.to_string())],
            );
            metric(
                &mut output,
                "permitgate_rate_limit_allowed",
                "Calls allowed by the rate limiter",
                "counter",
                &[(None, limiter.allowed.to_string())],
            );
            metric(
                &mut output,
                "permitgate_rate_limit_rejected",
                "Calls rejected by the rate limiter, by rule",
                "counter",
                &[
                    (Some("reason=\"window\""), limiter.rejected_window.to_string()),
                    (Some("reason=\"spacing\""), limiter.rejected_spacing.to_string()),
                ],
            );
        }

        // Background tasks
        let task_samples = |cycles: bool| {
            [
                (TaskKind::Tuner, &self.tuner),
                (TaskKind::Reaper, &self.reaper),
                (TaskKind::RateLimitSweeper, &self.rate_limit_sweeper),
            ]
            .iter()
            .map(|(kind, counters)| {
                let value = if cycles {
                    counters.cycles.load(Ordering::Relaxed)
                } else {
                    counters.failures.load(Ordering::Relaxed)
                };
                (Some(format!("task=\"{}\"", kind.name())), value.to_string())
            })
            .collect::<Vec<_>>()
        };
        metric_owned(
            &mut output,
            "permitgate_task_cycles",
            "Completed cycles of each background task",
            "counter",
            &task_samples(true),
        );
        metric_owned(
            &mut output,
            "permitgate_task_failures",
            "Failed cycles of each background task",
            "counter",
            &task_samples(false),
        );
        metric(
            &mut output,
            "permitgate_tuner_decisions",
            "Tuning decisions taken",
            "counter",
            &[
                (Some("decision=\"shrink\""), tasks.tuner_shrinks.to_string()),
                (Some("decision=\"grow\""), tasks.tuner_grows.to_string()),
                (Some("decision=\"hold\""), tasks.tuner_holds.to_string()),
            ],
        );
        metric(
            &mut output,
            "permitgate_memory_usage_percent",
            "Memory usage seen by the last tuning cycle",
            "gauge",
            &[(None, format!("{:.2}", tasks.last_memory_percent))],
        );
        metric(
            &mut output,
            "permitgate_thread_count",
            "Thread count seen by the last tuning cycle",
            "gauge",
            &[(None, tasks.last_thread_count.to_string())],
        );
        metric(
            &mut output,
            "permitgate_identities_reaped",
            "Idle identities removed",
            "counter",
            &[(None, tasks.identities_reaped.to_string())],
        );
        metric(
            &mut output,
            "permitgate_rate_limit_keys_evicted",
            "Idle rate limit keys removed",
            "counter",
            &[(None, tasks.rate_limit_keys_evicted.to_string())],
        );

        // Guards
        metric(
            &mut output,
            "permitgate_guarded_calls_failed",
            "Guarded upstream calls that failed, by cause",
            "counter",
            &[
                (Some("cause=\"timeout\""), tasks.calls_timed_out.to_string()),
                (Some("cause=\"upstream\""), tasks.calls_failed.to_string()),
            ],
        );
        metric(
            &mut output,
            "permitgate_streams_expired",
            "Streams cut off at their maximum hold time",
            "counter",
            &[(None, tasks.streams_expired.to_string())],
        );

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn metric(
    output: &mut String,
    name: &str,
    help: &str,
    kind: &str,
    samples: &[(Option<&str>, String)],
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {kind}");
    for (labels, value) in samples {
        match labels {
            Some(labels) => {
                let _ = writeln!(output, "{name}{{{labels}}} {value}");
            }
            None => {
                let _ = writeln!(output, "{name} {value}");
            }
        }
    }
    output.push('\n');
}

fn metric_owned(
    output: &mut String,
    name: &str,
    help: &str,
    kind: &str,
    samples: &[(Option<String>, String)],
) {
    let borrowed: Vec<(Option<&str>, String)> = samples
        .iter()
        .map(|(labels, value)| (labels.as_deref(), value.clone()))
        .collect();
    metric(output, name, help, kind, &borrowed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use permitgate::{AdmissionGate, RateLimitConfig, RateLimiter, StatsReporter};
    use std::sync::Arc;

    fn outcome(decision: TuningDecision) -> TuningOutcome {
        TuningOutcome {
            decision,
            memory_usage_percent: 72.5,
            thread_count: 24,
            rejection_rate: 0.0,
            interval_requests: 0,
            global_capacity: 100,
            identity_limit: 5,
        }
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tuner_cycles, 0);
        assert_eq!(snapshot.identities_reaped, 0);
        assert_eq!(snapshot.last_memory_percent, 0.0);
    }

    #[test]
    fn test_record_cycle() {
        let metrics = Metrics::new();
        metrics.record_cycle(TaskKind::Tuner, true);
        metrics.record_cycle(TaskKind::Tuner, false);
        metrics.record_cycle(TaskKind::Reaper, true);

        assert_eq!(metrics.tuner.cycles.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.tuner.failures.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.reaper.cycles.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.rate_limit_sweeper.cycles.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_tuning() {
        let metrics = Metrics::new();
        metrics.record_tuning(&outcome(TuningDecision::Shrink));
        metrics.record_tuning(&outcome(TuningDecision::Hold));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tuner_shrinks, 1);
        assert_eq!(snapshot.tuner_holds, 1);
        assert_eq!(snapshot.tuner_grows, 0);
        assert_eq!(snapshot.last_memory_percent, 72.5);
        assert_eq!(snapshot.last_thread_count, 24);
    }

    #[test]
    fn test_prometheus_export() {
        let gate = Arc::new(AdmissionGate::builder().build().unwrap());
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default()));
        let reporter = StatsReporter::new(Arc::clone(&gate)).with_rate_limiter(limiter);
        let metrics = Metrics::new();

        let _permit = gate.admit("user:1", "llm").unwrap();
        metrics.record_cycle(TaskKind::Reaper, true);

        let output = metrics.export_prometheus(&reporter.report());
        assert!(output.contains("# TYPE permitgate_requests_total counter"));
        assert!(output.contains("permitgate_requests_total 1\n"));
        assert!(output.contains("permitgate_requests_active 1\n"));
        assert!(output.contains("permitgate_requests_rejected{scope=\"identity\"} 0\n"));
        assert!(output.contains("permitgate_pool_capacity{pool=\"global\"} 100\n"));
        assert!(output.contains("permitgate_pool_in_use{pool=\"llm\"} 1\n"));
        assert!(output.contains("permitgate_pool_available{pool=\"tts\"} 20\n"));
        assert!(output.contains("permitgate_rate_limit_keys 0\n"));
        assert!(output.contains("permitgate_task_cycles{task=\"reaper\"} 1\n"));
    }
}
