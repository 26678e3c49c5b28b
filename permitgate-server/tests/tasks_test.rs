use clap::Parser;
use parking_lot::Mutex;
use permitgate::{
    AdmissionGate, DynamicTuner, GateError, IdleReaper, LoadSignals, LoadSnapshot, RateLimitConfig,
    RateLimiter, TuningPolicy,
};
use permitgate_server::config::{Args, Config};
use permitgate_server::metrics::{Metrics, TaskKind};
use permitgate_server::tasks::{
    BackgroundTasks, spawn_periodic, spawn_rate_limit_sweeper, spawn_reaper, spawn_tuner,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, sleep};

/// Load readings controlled by the test
struct ScriptedLoad {
    memory: Mutex<f64>,
    failing: AtomicBool,
}

impl ScriptedLoad {
    fn new(memory: f64) -> Arc<Self> {
        Arc::new(Self {
            memory: Mutex::new(memory),
            failing: AtomicBool::new(false),
        })
    }
}

impl LoadSignals for ScriptedLoad {
    fn snapshot(&self) -> Result<LoadSnapshot, GateError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GateError::TunerCycle("memory reading unavailable".into()));
        }
        Ok(LoadSnapshot {
            memory_usage_percent: *self.memory.lock(),
            thread_count: 8,
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_tuner_loop_survives_reading_failures() {
    let gate = Arc::new(AdmissionGate::builder().build().unwrap());
    let load = ScriptedLoad::new(90.0);
    load.failing.store(true, Ordering::SeqCst);
    let tuner = Arc::new(DynamicTuner::new(
        Arc::clone(&gate),
        load.clone(),
        TuningPolicy::default(),
    ));
    let metrics = Arc::new(Metrics::new());
    let (shutdown, rx) = watch::channel(false);

    let handle = spawn_tuner(tuner, Duration::from_secs(30), Arc::clone(&metrics), rx);

    // Three failing cycles at 30s, 60s and 90s
    sleep(Duration::from_secs(95)).await;
    assert_eq!(metrics.tuner.cycles.load(Ordering::Relaxed), 3);
    assert_eq!(metrics.tuner.failures.load(Ordering::Relaxed), 3);
    assert_eq!(gate.global_pool().capacity(), 100);

    // Readings recover under memory pressure
    load.failing.store(false, Ordering::SeqCst);
    sleep(Duration::from_secs(30)).await;
    assert_eq!(metrics.tuner.cycles.load(Ordering::Relaxed), 4);
    assert_eq!(metrics.tuner.failures.load(Ordering::Relaxed), 3);
    assert_eq!(metrics.tuner_shrinks.load(Ordering::Relaxed), 1);
    assert_eq!(gate.global_pool().capacity(), 80);
    assert_eq!(metrics.last_memory_percent(), 90.0);

    shutdown.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_tuner_loop_grows_when_idle() {
    let gate = Arc::new(AdmissionGate::builder().build().unwrap());
    let tuner = Arc::new(DynamicTuner::new(
        Arc::clone(&gate),
        ScriptedLoad::new(40.0),
        TuningPolicy::default(),
    ));
    let metrics = Arc::new(Metrics::new());
    let (shutdown, rx) = watch::channel(false);

    let handle = spawn_tuner(tuner, Duration::from_secs(10), Arc::clone(&metrics), rx);
    sleep(Duration::from_secs(25)).await;

    // 100 -> 110 -> 121
    assert_eq!(metrics.tuner_grows.load(Ordering::Relaxed), 2);
    assert_eq!(gate.global_pool().capacity(), 121);

    shutdown.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reaper_loop_removes_idle_identities() {
    let gate = Arc::new(AdmissionGate::builder().build().unwrap());
    let metrics = Arc::new(Metrics::new());
    let (shutdown, rx) = watch::channel(false);

    let start = Instant::now().into_std();
    gate.admit_at("user:idle", "llm", start).unwrap().release();
    let busy = gate.admit_at("user:busy", "streaming", start).unwrap();

    let reaper = IdleReaper::new(Arc::clone(&gate), Duration::from_secs(60));
    let handle = spawn_reaper(reaper, Duration::from_secs(30), Arc::clone(&metrics), rx);

    // Idle for exactly 60s at the second sweep, so still kept
    sleep(Duration::from_secs(65)).await;
    assert_eq!(gate.stats().active_identities, 2);

    sleep(Duration::from_secs(30)).await;
    let stats = gate.stats();
    assert_eq!(stats.active_identities, 1);
    assert_eq!(metrics.identities_reaped.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.reaper.cycles.load(Ordering::Relaxed), 3);

    // An identity with a request in flight is never reaped
    let identities = gate.identity_stats(Instant::now().into_std());
    assert_eq!(identities[0].identity, "user:busy");
    drop(busy);
    assert_eq!(gate.stats().accounting_anomalies, 0);

    shutdown.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_sweeper_evicts_idle_keys() {
    let limiter = Arc::new(RateLimiter::new(
        RateLimitConfig::builder()
            .idle_eviction(Duration::from_secs(60))
            .build()
            .unwrap(),
    ));
    let metrics = Arc::new(Metrics::new());
    let (shutdown, rx) = watch::channel(false);

    limiter
        .check_at("ip:192.0.2.10", Instant::now().into_std())
        .unwrap();
    assert_eq!(limiter.len(), 1);

    let handle = spawn_rate_limit_sweeper(
        Arc::clone(&limiter),
        Duration::from_secs(30),
        Arc::clone(&metrics),
        rx,
    );
    sleep(Duration::from_secs(95)).await;

    assert!(limiter.is_empty());
    assert_eq!(metrics.rate_limit_keys_evicted.load(Ordering::Relaxed), 1);

    shutdown.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_panicking_cycle_is_contained() {
    let metrics = Arc::new(Metrics::new());
    let (shutdown, rx) = watch::channel(false);
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let handle = spawn_periodic(
        TaskKind::Reaper,
        Duration::from_secs(10),
        Arc::clone(&metrics),
        rx,
        move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("sweep exploded");
            }
            Ok(())
        },
    );

    sleep(Duration::from_secs(35)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(metrics.reaper.cycles.load(Ordering::Relaxed), 3);
    assert_eq!(metrics.reaper.failures.load(Ordering::Relaxed), 1);

    shutdown.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_cycle_retries_next_period() {
    let metrics = Arc::new(Metrics::new());
    let (shutdown, rx) = watch::channel(false);

    let handle = spawn_periodic(
        TaskKind::RateLimitSweeper,
        Duration::from_secs(5),
        Arc::clone(&metrics),
        rx,
        || Err(GateError::ReaperCycle("store locked".into())),
    );

    sleep(Duration::from_secs(21)).await;
    let counters = metrics.task(TaskKind::RateLimitSweeper);
    assert_eq!(counters.cycles.load(Ordering::Relaxed), 4);
    assert_eq!(counters.failures.load(Ordering::Relaxed), 4);

    shutdown.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_background_tasks_start_and_shutdown() {
    let config = Config::from_args(Args::try_parse_from(["permitgate"]).unwrap()).unwrap();
    let gate = Arc::new(config.build_gate().unwrap());
    let limiter = Arc::new(config.build_rate_limiter());
    let metrics = Arc::new(Metrics::new());

    let background = BackgroundTasks::start(
        &config,
        Arc::clone(&gate),
        limiter,
        ScriptedLoad::new(70.0),
        Arc::clone(&metrics),
    );
    let mut observer = background.subscribe();

    sleep(config.tuning.interval + Duration::from_secs(1)).await;
    assert_eq!(metrics.tuner.cycles.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.tuner_holds.load(Ordering::Relaxed), 1);

    background.shutdown().await;
    assert!(*observer.borrow_and_update());

    // Pools keep their state after the tasks stop
    assert_eq!(gate.global_pool().capacity(), 100);
}
