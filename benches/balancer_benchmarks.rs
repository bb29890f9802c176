//! # Balancer Benchmarks
//!
//! Cost of one pick from the smooth weighted round-robin balancer, alone and under contention.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use url::Url;

use api_dataplane::load_balancing::{LoadBalancer, SmoothWeightedRoundRobin, WeightedTarget};

fn weighted_balancer(targets: usize) -> SmoothWeightedRoundRobin {
    let targets = (0..targets)
        .map(|i| WeightedTarget {
            url: Url::parse(&format!("http://10.0.{}.{}:8080", i / 250, i % 250 + 1)).unwrap(),
            weight: (i % 5 + 1) as u32,
        })
        .collect();
    SmoothWeightedRoundRobin::new(targets).unwrap()
}

fn benchmark_pick(c: &mut Criterion) {
    let mut group = c.benchmark_group("swrr_pick");
    group.throughput(Throughput::Elements(1));

    for targets in [2, 10, 100] {
        let balancer = weighted_balancer(targets);
        group.bench_with_input(BenchmarkId::from_parameter(targets), &targets, |b, _| {
            b.iter(|| black_box(balancer.next()));
        });
    }

    group.finish();
}

fn benchmark_contended_pick(c: &mut Criterion) {
    let mut group = c.benchmark_group("swrr_contended");
    let picks_per_thread = 1_000;

    for threads in [2, 4, 8] {
        let balancer = Arc::new(weighted_balancer(10));
        group.throughput(Throughput::Elements((threads * picks_per_thread) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                std::thread::scope(|scope| {
                    for _ in 0..threads {
                        let balancer = Arc::clone(&balancer);
                        scope.spawn(move || {
                            for _ in 0..picks_per_thread {
                                black_box(balancer.next());
                            }
                        });
                    }
                });
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_pick, benchmark_contended_pick);
criterion_main!(benches);
