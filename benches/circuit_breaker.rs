use criterion::{black_box, criterion_group, criterion_main, Criterion};
use resilience_policy::repository::PolicyRepository;
use resilience_policy::{CallContext, CircuitBreaker, CircuitBreakerConfig, InMemoryKvStore, Policy, ResilienceEngine};
use std::sync::Arc;
use std::time::Duration;

fn config(failure_threshold: u32) -> CircuitBreakerConfig {
    CircuitBreakerConfig::new(failure_threshold, 1, Duration::from_secs(30), 1).unwrap()
}

// Closed breaker: every call is admitted and recorded as a success.
fn admission_closed(c: &mut Criterion) {
    let breaker = CircuitBreaker::new("bench", config(10));
    c.bench_function("circuit_breaker_admit_closed", |b| {
        b.iter(|| {
            let permit = black_box(&breaker).try_acquire().unwrap();
            black_box(permit.record(true));
        });
    });
}

// Open breaker: every call is rejected without reaching the dependency.
fn admission_open(c: &mut Criterion) {
    let breaker = CircuitBreaker::new("bench", config(1));
    let _ = breaker.try_acquire().unwrap().record(false);
    c.bench_function("circuit_breaker_reject_open", |b| {
        b.iter(|| black_box(black_box(&breaker).try_acquire().is_err()));
    });
}

// Full engine path for a policy holding only a breaker, with the repository cache warm.
fn engine_execute(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let engine = ResilienceEngine::builder().store(Arc::new(InMemoryKvStore::new())).build().unwrap();
    rt.block_on(async {
        let policy = Policy::builder("bench").circuit_breaker(config(10)).build().unwrap();
        engine.repository().save(policy).await.unwrap();
    });
    let ctx = CallContext::new();

    c.bench_function("engine_execute_breaker_only", |b| {
        b.to_async(&rt).iter(|| async {
            let out = engine.execute(&ctx, "bench", || async { Ok::<_, std::io::Error>(1u32) }).await;
            black_box(out).unwrap();
        });
    });
}

criterion_group!(benches, admission_closed, admission_open, engine_execute);
criterion_main!(benches);
