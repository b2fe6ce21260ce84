//! Rate limiter admission benchmark.
//!
//! Measures admit latency on hot and cold windows and the cost of evicting
//! expired windows, using Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use devpool::kernel::{RateLimitRule, RateLimiter};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

fn limiter() -> RateLimiter {
    let mut rules = HashMap::new();
    rules.insert("sign".to_string(), RateLimitRule::new(u32::MAX, Duration::from_secs(60)));
    rules.insert("tight".to_string(), RateLimitRule::new(1, Duration::from_secs(60)));
    RateLimiter::new(rules)
}

fn bench_admit(c: &mut Criterion) {
    let mut group = c.benchmark_group("admit");

    let mut hot = limiter();
    let now = Instant::now();
    group.bench_function("same_caller", |b| {
        b.iter(|| hot.admit_at(black_box("alice"), black_box("sign"), now))
    });

    let mut rejecting = limiter();
    rejecting.admit_at("alice", "tight", now);
    group.bench_function("rejected", |b| {
        b.iter(|| rejecting.admit_at(black_box("alice"), black_box("tight"), now))
    });

    let mut unlimited = limiter();
    group.bench_function("unlimited_class", |b| {
        b.iter(|| unlimited.admit_at(black_box("alice"), black_box("other"), now))
    });

    let callers: Vec<String> = (0..10_000).map(|i| format!("caller-{}", i)).collect();
    let mut spread = limiter();
    let mut i = 0;
    group.bench_function("many_callers", |b| {
        b.iter(|| {
            i = (i + 1) % callers.len();
            spread.admit_at(black_box(&callers[i]), "sign", now)
        })
    });
    group.finish();
}

fn bench_cleanup(c: &mut Criterion) {
    let mut group = c.benchmark_group("cleanup_expired");
    for &windows in &[100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(windows), &windows, |b, &n| {
            b.iter_batched(
                || {
                    let mut limiter = limiter();
                    let start = Instant::now();
                    for i in 0..n {
                        limiter.admit_at(&format!("caller-{}", i), "sign", start);
                    }
                    (limiter, start + Duration::from_secs(61))
                },
                |(mut limiter, later)| limiter.cleanup_expired_at(later),
                criterion::BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_admit, bench_cleanup);
criterion_main!(benches);
