//! BatchBuffer throughput benchmarks
//!
//! Measures enqueue-to-resolution cost for batches of different capacities,
//! and the in-memory queue item writer end to end.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tasker_scheduler::buffer::{BatchBuffer, BatchBufferOptions, QueueItemWriter};
use tasker_scheduler::config::BufferConfig;
use tasker_scheduler::models::{NewQueueItem, Tenant};
use tasker_scheduler::storage::InMemoryStorage;
use tokio::runtime::Runtime;
use uuid::Uuid;

const ITEMS: u64 = 1_000;

fn benchmark_enqueue_and_flush(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("batch_buffer_flush");

    for capacity in [10usize, 100, 500] {
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &capacity, |b, &capacity| {
            b.iter(|| {
                runtime.block_on(async {
                    let buffer = BatchBuffer::new(BatchBufferOptions::new(
                        "bench",
                        capacity,
                        usize::MAX,
                        Duration::from_millis(5),
                        |items: Vec<u64>| async move { Ok(items) },
                        |_: &u64| 8,
                    ))
                    .unwrap();
                    let shutdown = buffer.start().unwrap();

                    let mut handles = Vec::with_capacity(ITEMS as usize);
                    for i in 0..ITEMS {
                        handles.push(buffer.enqueue(i).await.unwrap());
                    }
                    shutdown.shutdown().await.unwrap();
                    black_box(join_all(handles).await)
                })
            });
        });
    }
    group.finish();
}

fn benchmark_queue_item_writer(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let tenant_id = Uuid::new_v4();
    let storage = Arc::new(InMemoryStorage::new());
    storage.add_tenant(Tenant::new(tenant_id, "bench"));

    c.bench_function("queue_item_writer", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let writer = QueueItemWriter::start(storage.clone(), &BufferConfig::default()).unwrap();
                let writes = (0..ITEMS).map(|_| {
                    writer.write(NewQueueItem::new(tenant_id, "default", Uuid::new_v4(), "bench:act"))
                });
                let ids = join_all(writes).await;
                writer.shutdown().await.unwrap();
                black_box(ids)
            })
        });
    });
}

criterion_group!(benches, benchmark_enqueue_and_flush, benchmark_queue_item_writer);
criterion_main!(benches);
