use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use permitgate::{AdmissionGate, PermitPool, PoolBounds, RateLimitConfig, RateLimiter};
use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn benchmark_permit_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("permit_pool");
    group.throughput(Throughput::Elements(1));

    group.bench_function("acquire_release", |b| {
        let pool = PermitPool::new("bench", PoolBounds::new(100, 50, 200));
        b.iter(|| {
            let acquired = pool.try_acquire();
            if acquired {
                pool.release().ok();
            }
            black_box(acquired)
        });
    });

    group.bench_function("scale_alternating", |b| {
        let pool = PermitPool::new("bench", PoolBounds::new(100, 50, 200));
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let factor = if counter % 2 == 0 { 0.8 } else { 1.1 };
            black_box(pool.scale(black_box(factor)))
        });
    });

    group.finish();
}

fn benchmark_admission_gate(c: &mut Criterion) {
    let mut group = c.benchmark_group("admission_gate");
    group.throughput(Throughput::Elements(1));
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("single_identity", |b| {
        let gate = Arc::new(AdmissionGate::builder().build().unwrap());
        b.iter(|| {
            let permit = gate.admit(black_box("user:1"), black_box("llm"));
            black_box(permit.is_ok())
        });
    });

    // Many identities exercise the get-or-create path
    group.bench_function("rotating_identities_1000", |b| {
        let gate = Arc::new(AdmissionGate::builder().build().unwrap());
        let mut counter = 0u64;
        b.iter(|| {
            let identity = format!("user:{}", counter % 1000);
            counter += 1;
            let permit = gate.admit(black_box(&identity), black_box("streaming"));
            black_box(permit.is_ok())
        });
    });

    group.bench_function("rejected_at_identity", |b| {
        let gate = Arc::new(
            AdmissionGate::builder()
                .identity(PoolBounds::fixed(1))
                .build()
                .unwrap(),
        );
        let _held = gate.admit("user:1", "llm").unwrap();
        b.iter(|| black_box(gate.acquire(black_box("user:1"), black_box("llm"))));
    });

    group.finish();
}

fn benchmark_rate_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter");
    group.throughput(Throughput::Elements(1));

    group.bench_function("rotating_keys_100", |b| {
        let limiter = RateLimiter::new(
            RateLimitConfig::builder()
                .max_per_window(u32::MAX)
                .min_spacing(Duration::ZERO)
                .build()
                .unwrap(),
        );
        let start = Instant::now();
        let mut counter = 0u64;
        b.iter(|| {
            let key = format!("user:{}", counter % 100);
            counter += 1;
            black_box(limiter.check_at(black_box(&key), start).is_ok())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_permit_pool,
    benchmark_admission_gate,
    benchmark_rate_limiter
);
criterion_main!(benches);
