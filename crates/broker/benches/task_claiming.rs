//! Task claiming benchmark
//!
//! Benchmarks the worker hot path: enqueue → lease → ack
//! on the in-memory store, alone and under contention.

use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use deferq_broker::persistence::InMemoryTaskStore;
use deferq_broker::{Broker, BrokerConfig, EnqueueOptions};

fn broker() -> Broker {
    Broker::new(Arc::new(InMemoryTaskStore::new()), BrokerConfig::default()).unwrap()
}

async fn fill(broker: &Broker, count: u64) {
    for i in 0..count {
        broker
            .enqueue("bench", i.to_be_bytes().to_vec(), EnqueueOptions::new())
            .await
            .unwrap();
    }
}

/// Benchmark single-threaded lease + ack (baseline)
fn bench_claim_single(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("task_claiming/single");
    group.throughput(Throughput::Elements(1));

    for batch_size in [1usize, 5, 10] {
        group.bench_with_input(
            BenchmarkId::new("batch", batch_size),
            &batch_size,
            |b, &batch_size| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let broker = broker();
                    let task_count = iters.max(100);
                    fill(&broker, task_count).await;

                    // Measure lease + ack time
                    let start = Instant::now();
                    let mut claimed_total = 0u64;

                    while claimed_total < task_count {
                        let leased = broker.lease("bench", None, batch_size).await.unwrap();
                        claimed_total += leased.len() as u64;

                        for task in leased {
                            broker.ack(task.id, task.lease_token).await.unwrap();
                        }
                    }

                    start.elapsed()
                });
            },
        );
    }

    group.finish();
}

/// Benchmark concurrent lease + ack (contention on shared records)
fn bench_claim_concurrent(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("task_claiming/concurrent");
    group.sample_size(20);

    for workers in [2usize, 4, 8] {
        let task_count = 5000u64;
        group.throughput(Throughput::Elements(task_count));
        group.bench_with_input(
            BenchmarkId::new("workers", workers),
            &workers,
            |b, &workers| {
                b.to_async(&rt).iter(|| async move {
                    let broker = broker();
                    fill(&broker, task_count).await;

                    let handles: Vec<_> = (0..workers)
                        .map(|_| {
                            let broker = broker.clone();
                            tokio::spawn(async move {
                                loop {
                                    let leased = broker.lease("bench", None, 10).await.unwrap();
                                    if leased.is_empty() {
                                        break;
                                    }
                                    for task in leased {
                                        broker.ack(task.id, task.lease_token).await.unwrap();
                                    }
                                }
                            })
                        })
                        .collect();

                    for handle in handles {
                        handle.await.unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark enqueue with and without dedupe keys
fn bench_enqueue(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("task_claiming/enqueue");
    group.throughput(Throughput::Elements(1));
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("plain", |b| {
        let broker = broker();
        b.to_async(&rt).iter(|| {
            let broker = broker.clone();
            async move {
                broker
                    .enqueue("bench", b"payload".to_vec(), EnqueueOptions::new())
                    .await
                    .unwrap()
            }
        });
    });

    group.bench_function("dedupe_hit", |b| {
        let broker = broker();
        b.to_async(&rt).iter(|| {
            let broker = broker.clone();
            async move {
                broker
                    .enqueue(
                        "bench",
                        b"payload".to_vec(),
                        EnqueueOptions::new().with_dedupe_key("same"),
                    )
                    .await
                    .unwrap()
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_claim_single,
    bench_claim_concurrent,
    bench_enqueue
);
criterion_main!(benches);
