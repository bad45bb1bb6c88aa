//! Resilience engine benchmarks
//!
//! Covers the hot admission paths (breaker, limiter, bulkhead), backoff
//! arithmetic, metrics recording and the full `execute` pipeline.
//!
//! Run with: `cargo bench --bench resilience_bench -p agui-resilience`

use std::time::Duration;

use agui_resilience::{
    Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig, MetricsCollector,
    MetricsConfig, OperationError, RateLimitConfig, RateLimiter, ResilienceConfig,
    ResilienceManager, RetryConfigBuilder, RetryManager,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Builder as RuntimeBuilder;
use tokio_util::sync::CancellationToken;

fn build_runtime() -> tokio::runtime::Runtime {
    RuntimeBuilder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("tokio runtime should build for benchmarks")
}

// ============================================================================
// Admission Benchmarks
// ============================================================================

fn bench_circuit_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");

    group.bench_function("allow_and_record_success", |b| {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default())
            .expect("default breaker config is valid");
        b.iter(|| {
            if black_box(breaker.allow_request()) {
                breaker.record_success();
            }
        });
    });

    group.bench_function("trip_to_open", |b| {
        b.iter(|| {
            let config = CircuitBreakerConfig::quick(5, Duration::from_secs(30));
            let breaker = CircuitBreaker::new(config).expect("quick breaker config is valid");
            for _ in 0..5 {
                breaker.allow_request();
                breaker.record_failure();
            }
            black_box(breaker.get_state());
        });
    });

    group.finish();
}

fn bench_rate_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter");

    group.bench_function("allow", |b| {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: true,
            requests_per_second: u64::MAX / 2,
            burst_size: u64::MAX / 2,
        })
        .expect("valid limiter config");
        b.iter(|| black_box(limiter.allow()));
    });

    group.bench_function("available_tokens", |b| {
        let limiter = RateLimiter::new(RateLimitConfig::default()).expect("valid limiter config");
        b.iter(|| black_box(limiter.available_tokens()));
    });

    group.finish();
}

fn bench_bulkhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulkhead");
    let runtime = build_runtime();

    for max_concurrent in [1_usize, 16] {
        let bulkhead = {
            let _guard = runtime.enter();
            Bulkhead::new(BulkheadConfig {
                max_concurrent_requests: max_concurrent,
                ..BulkheadConfig::default()
            })
            .expect("valid bulkhead config")
        };
        let cancel = CancellationToken::new();

        group.bench_with_input(
            BenchmarkId::new("acquire_release", max_concurrent),
            &max_concurrent,
            |b, _| {
                b.to_async(&runtime).iter(|| async {
                    let permit = bulkhead.acquire(&cancel).await.expect("uncontended acquire");
                    bulkhead.release(permit);
                });
            },
        );
    }

    group.finish();
}

// ============================================================================
// Retry Benchmarks
// ============================================================================

fn bench_retry_delays(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_delays");
    let config = RetryConfigBuilder::new()
        .max_attempts(10)
        .exponential_backoff(Duration::from_millis(100), 2.0, Duration::from_secs(30))
        .jitter(0.1)
        .build()
        .expect("valid retry config");
    let manager = RetryManager::with_seed(config, 42).expect("valid retry config");

    for attempt in [1_u32, 5, 10] {
        group.bench_with_input(BenchmarkId::new("backoff_delay", attempt), &attempt, |b, &n| {
            b.iter(|| black_box(manager.backoff_delay(black_box(n))));
        });
        group.bench_with_input(BenchmarkId::new("jittered_delay", attempt), &attempt, |b, &n| {
            b.iter(|| black_box(manager.jittered_delay(black_box(n))));
        });
    }

    group.finish();
}

// ============================================================================
// Metrics & Pipeline Benchmarks
// ============================================================================

fn bench_metrics(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics");

    group.bench_function("record_success_detailed", |b| {
        let collector = MetricsCollector::new(MetricsConfig::default()).expect("valid config");
        b.iter(|| collector.record_success(black_box(Duration::from_millis(42))));
    });

    group.bench_function("snapshot", |b| {
        let collector = MetricsCollector::new(MetricsConfig::default()).expect("valid config");
        for ms in 0..1_000 {
            collector.record_success(Duration::from_millis(ms));
        }
        b.iter(|| black_box(collector.get_metrics()));
    });

    group.finish();
}

fn bench_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute");
    let runtime = build_runtime();

    let managers = {
        let _guard = runtime.enter();
        [
            ("minimal", ResilienceConfig::minimal()),
            ("production", {
                let mut config = ResilienceConfig::production();
                config.rate_limit.enabled = false;
                config.health_check.enabled = false;
                config
            }),
        ]
        .map(|(name, config)| {
            (name, ResilienceManager::new(config).expect("benchmark config is valid"))
        })
    };

    for (name, manager) in &managers {
        group.bench_function(BenchmarkId::new("success", name), |b| {
            b.to_async(&runtime).iter(|| async {
                let value = manager
                    .execute(|_cancel| async { Ok::<_, OperationError>(black_box(7_u32)) })
                    .await
                    .expect("pipeline success");
                black_box(value);
            });
        });
    }

    group.finish();
}

criterion_group!(
    resilience,
    bench_circuit_breaker,
    bench_rate_limiter,
    bench_bulkhead,
    bench_retry_delays,
    bench_metrics,
    bench_execute
);
criterion_main!(resilience);
