use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};

use lakepurge_core::{
    quota, validate_queue_items, ExecutionId, JobId, MatchColumn, NewQueueItem, QueueVisibility,
};
use lakepurge_infra::config::DispatcherSettings;
use lakepurge_infra::dispatcher::{RecordingLauncher, WorkQueueDispatcher};
use lakepurge_infra::work_queue::{InMemoryWorkQueue, WorkQueue};
use std::sync::Arc;

fn settings() -> DispatcherSettings {
    DispatcherSettings {
        receive_wait_seconds: 0,
        ..DispatcherSettings::default()
    }
}

fn filled_queue(n: usize) -> Arc<InMemoryWorkQueue> {
    let queue = Arc::new(InMemoryWorkQueue::new());
    for i in 0..n {
        let body = serde_json::json!({
            "QueryId": format!("q{i}"),
            "Database": "db",
            "Table": "events",
            "Columns": [{ "Column": "customer_id", "MatchIds": ["a", "b", "c"] }],
        });
        queue.send(&body.to_string()).unwrap();
    }
    queue
}

/// Benchmark: one dispatch tick at increasing quotas.
fn bench_dispatch_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_tick");

    for limit in [1u32, 10, 20, 100] {
        group.throughput(Throughput::Elements(u64::from(limit)));
        group.bench_with_input(BenchmarkId::from_parameter(limit), &limit, |b, &limit| {
            let job_id = JobId::new();
            let execution = ExecutionId::new("bench");

            b.iter_batched(
                || {
                    let queue = filled_queue(limit as usize);
                    WorkQueueDispatcher::new(queue, Arc::new(RecordingLauncher::new()), settings())
                },
                |dispatcher| {
                    let visibility = dispatcher.queue().visibility().unwrap();
                    let report = dispatcher
                        .dispatch(job_id, &execution, black_box(limit), visibility)
                        .unwrap();
                    black_box(report);
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark: quota calculation (hot path of every tick).
fn bench_quota(c: &mut Criterion) {
    c.bench_function("quota", |b| {
        b.iter(|| quota(black_box(20), black_box(QueueVisibility::new(30, 5))));
    });
}

/// Benchmark: validating a large enqueue batch.
fn bench_validate_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("validate_queue_items");

    for size in [10usize, 100, 1000] {
        let items: Vec<NewQueueItem> = (0..size)
            .map(|i| {
                if i % 2 == 0 {
                    NewQueueItem::simple(format!("id-{i}"))
                } else {
                    NewQueueItem::composite(
                        [
                            MatchColumn::new("first_name", format!("f{i}")),
                            MatchColumn::new("last_name", format!("l{i}")),
                        ],
                        "mapper",
                    )
                }
            })
            .collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &items, |b, items| {
            b.iter(|| validate_queue_items(black_box(items)).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_dispatch_tick, bench_quota, bench_validate_batch);
criterion_main!(benches);
