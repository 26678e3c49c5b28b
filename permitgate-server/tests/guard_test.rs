use futures::StreamExt;
use permitgate::{
    AdmissionGate, GateError, PoolBounds, PoolScope, RateLimitConfig, RateLimitKey, RateLimiter,
};
use clap::Parser;
use futures::Stream;
use permitgate_server::config::{Args, Config, GuardConfig};
use permitgate_server::guard::{AdmissionGuard, CallError};
use permitgate_server::metrics::Metrics;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

fn setup(stream_max_hold: Duration) -> (AdmissionGuard, Arc<AdmissionGate>, Arc<Metrics>) {
    let gate = Arc::new(
        AdmissionGate::builder()
            .global(PoolBounds::fixed(4))
            .identity(PoolBounds::fixed(2))
            .build()
            .unwrap(),
    );
    let limiter = Arc::new(RateLimiter::new(
        RateLimitConfig::builder()
            .min_spacing(Duration::ZERO)
            .build()
            .unwrap(),
    ));
    let metrics = Arc::new(Metrics::new());
    let config = GuardConfig {
        upstream_timeout: Duration::from_secs(5),
        stream_max_hold,
    };
    let guard = AdmissionGuard::new(Arc::clone(&gate), limiter, &config, Arc::clone(&metrics));
    (guard, gate, metrics)
}

const HOLD: Duration = Duration::from_secs(300);

fn user(id: &str) -> RateLimitKey {
    RateLimitKey::User(id.to_string())
}

#[tokio::test]
async fn test_cancelled_stream_releases_permit() {
    let (guard, gate, _) = setup(HOLD);

    let mut stream = guard
        .stream(&user("7"), "user:7", "streaming", futures::stream::iter(vec![1, 2, 3]))
        .unwrap();
    assert_eq!(stream.next().await, Some(1));
    assert!(stream.is_holding());
    assert_eq!(gate.stats().current_active_requests, 1);
    assert_eq!(gate.type_pool("streaming").unwrap().available(), 29);

    // Client disconnects mid-stream
    drop(stream);

    let stats = gate.stats();
    assert_eq!(stats.current_active_requests, 0);
    assert_eq!(stats.global.available, 4);
    assert_eq!(stats.accounting_anomalies, 0);
    assert_eq!(gate.type_pool("streaming").unwrap().available(), 30);
    assert_eq!(gate.identity_stats(std::time::Instant::now())[0].active, 0);
}

#[tokio::test]
async fn test_completed_stream_releases_permit_once() {
    let (guard, gate, _) = setup(HOLD);

    let stream = guard
        .stream(&user("7"), "user:7", "stream", futures::stream::iter(vec!["a", "b"]))
        .unwrap();
    let chunks: Vec<&str> = stream.collect().await;
    assert_eq!(chunks, vec!["a", "b"]);

    let stats = gate.stats();
    assert_eq!(stats.current_active_requests, 0);
    assert_eq!(stats.accounting_anomalies, 0);
    assert_eq!(gate.type_pool("streaming").unwrap().available(), 30);
}

#[tokio::test]
async fn test_stream_finished_then_dropped_releases_once() {
    let (guard, gate, _) = setup(HOLD);

    let mut stream = guard
        .stream(&user("7"), "user:7", "tts", futures::stream::iter(vec![1u8]))
        .unwrap();
    assert_eq!(stream.next().await, Some(1));
    assert_eq!(stream.next().await, None);
    assert!(!stream.is_holding());
    assert_eq!(stream.next().await, None);
    drop(stream);

    let stats = gate.stats();
    assert_eq!(stats.current_active_requests, 0);
    assert_eq!(stats.accounting_anomalies, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stream_released_at_max_hold() {
    let (guard, gate, metrics) = setup(HOLD);

    let mut stream = guard
        .stream(&user("9"), "user:9", "streaming", futures::stream::pending::<u32>())
        .unwrap();
    assert_eq!(gate.stats().current_active_requests, 1);

    // The paused clock jumps straight to the deadline
    assert_eq!(stream.next().await, None);
    assert!(!stream.is_holding());
    assert_eq!(gate.stats().current_active_requests, 0);
    assert_eq!(metrics.streams_expired.load(Ordering::Relaxed), 1);
}

/// Upstream stream that never yields and records when it is dropped
struct StalledUpstream {
    dropped: Arc<AtomicBool>,
}

impl Stream for StalledUpstream {
    type Item = u32;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<u32>> {
        Poll::Pending
    }
}

impl Drop for StalledUpstream {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn test_default_config_bounds_stalled_stream() {
    let config = Config::from_args(Args::try_parse_from(["permitgate"]).unwrap()).unwrap();
    let gate = Arc::new(config.build_gate().unwrap());
    let limiter = Arc::new(config.build_rate_limiter());
    let metrics = Arc::new(Metrics::new());
    let guard = AdmissionGuard::new(Arc::clone(&gate), limiter, &config.guard, Arc::clone(&metrics));

    let started = tokio::time::Instant::now();
    let mut stream = guard
        .stream(&user("11"), "user:11", "streaming", futures::stream::pending::<u32>())
        .unwrap();
    assert_eq!(gate.stats().current_active_requests, 1);

    assert_eq!(stream.next().await, None);
    assert!(started.elapsed() >= config.guard.stream_max_hold);
    assert!(!stream.is_holding());
    assert_eq!(gate.stats().current_active_requests, 0);
    assert_eq!(metrics.streams_expired.load(Ordering::Relaxed), 1);
}

#[tokio::test(start_paused = true)]
async fn test_expired_stream_drops_upstream() {
    let (guard, gate, _) = setup(Duration::from_secs(30));
    let dropped = Arc::new(AtomicBool::new(false));
    let upstream = StalledUpstream {
        dropped: Arc::clone(&dropped),
    };

    let mut stream = guard.stream(&user("12"), "user:12", "llm", upstream).unwrap();
    assert_eq!(stream.next().await, None);

    // The permit and the upstream go away together
    assert!(dropped.load(Ordering::SeqCst));
    assert_eq!(gate.stats().current_active_requests, 0);
    assert_eq!(stream.next().await, None);
}

#[tokio::test]
async fn test_rejected_stream_is_never_polled() {
    let (guard, gate, _) = setup(HOLD);

    let first = guard
        .stream(&user("1"), "user:1", "llm", futures::stream::pending::<u32>())
        .unwrap();
    let second = guard
        .stream(&user("1"), "user:1", "llm", futures::stream::pending::<u32>())
        .unwrap();
    let err = guard
        .stream(&user("1"), "user:1", "llm", futures::stream::pending::<u32>())
        .err()
        .unwrap();
    assert_eq!(
        err,
        GateError::OverCapacity {
            scope: PoolScope::Identity
        }
    );

    drop(first);
    drop(second);
    assert_eq!(gate.stats().current_active_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_call_timeout_releases_permit() {
    let (guard, gate, metrics) = setup(HOLD);

    let err = guard
        .call(&user("3"), "user:3", "asr", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, std::io::Error>("transcript")
        })
        .await
        .unwrap_err();

    assert!(matches!(err, CallError::TimedOut(d) if d == Duration::from_secs(5)));
    assert_eq!(gate.stats().current_active_requests, 0);
    assert_eq!(gate.type_pool("asr").unwrap().available(), 20);
    assert_eq!(metrics.calls_timed_out.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_dropped_call_releases_permit() {
    let (guard, gate, _) = setup(HOLD);
    let key = user("4");

    let mut call = Box::pin(guard.call(
        &key,
        "user:4",
        "llm",
        std::future::pending::<Result<(), std::io::Error>>(),
    ));
    assert!(futures::poll!(call.as_mut()).is_pending());
    assert_eq!(gate.stats().current_active_requests, 1);

    // Caller gives up, e.g. the HTTP request was cancelled
    drop(call);
    assert_eq!(gate.stats().current_active_requests, 0);
    assert_eq!(gate.global_pool().available(), 4);
}

#[tokio::test]
async fn test_upstream_failure_is_counted() {
    let (guard, gate, metrics) = setup(HOLD);

    let err = guard
        .call(&user("5"), "user:5", "tts", async {
            Err::<(), _>(std::io::Error::other("voice model unavailable"))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, CallError::Upstream(_)));
    assert_eq!(metrics.calls_failed.load(Ordering::Relaxed), 1);
    assert_eq!(gate.stats().current_active_requests, 0);
}

#[test]
fn test_rate_limit_checked_before_admission() {
    let gate = Arc::new(AdmissionGate::builder().build().unwrap());
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default()));
    let config = GuardConfig {
        upstream_timeout: Duration::from_secs(5),
        stream_max_hold: HOLD,
    };
    let guard = AdmissionGuard::new(Arc::clone(&gate), limiter, &config, Arc::new(Metrics::new()));
    let key = RateLimitKey::Ip("203.0.113.9".to_string());

    let permit = guard.admit_request(&key, "anon-1", "llm").unwrap();
    drop(permit);

    // Second call inside the minimum spacing
    let err = guard.admit_request(&key, "anon-1", "llm").unwrap_err();
    assert!(matches!(err, GateError::RateLimited { .. }));

    let stats = gate.stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.rejected_requests, 0);
}
