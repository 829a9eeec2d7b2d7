//! BatchBuffer behaviour through the public API: flush triggers,
//! backpressure, failure isolation and shutdown.

mod common;

use common::*;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tasker_scheduler::buffer::{BatchBuffer, BatchBufferOptions, QueueItemWriter};
use tasker_scheduler::config::BufferConfig;
use tasker_scheduler::models::NewQueueItem;
use tasker_scheduler::storage::QueueTable;
use tasker_scheduler::SchedulerError;
use tokio::sync::Semaphore;
use uuid::Uuid;

const LONG: Duration = Duration::from_secs(3600);

/// Buffer whose flush doubles each item and records batch sizes.
fn recording_buffer(
    capacity: usize,
    max_bytes: usize,
    period: Duration,
) -> (BatchBuffer<u32, u32>, Arc<Mutex<Vec<usize>>>) {
    let batches = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&batches);
    let buffer = BatchBuffer::new(BatchBufferOptions::new(
        "recording",
        capacity,
        max_bytes,
        period,
        move |items: Vec<u32>| {
            recorded.lock().push(items.len());
            async move { Ok(items.into_iter().map(|i| i * 2).collect()) }
        },
        |_: &u32| 4,
    ))
    .unwrap();
    (buffer, batches)
}

#[tokio::test]
async fn test_capacity_trigger_splits_batches() {
    let (buffer, batches) = recording_buffer(3, usize::MAX, LONG);
    let shutdown = buffer.start().unwrap();

    let mut handles = Vec::new();
    for i in 0..7 {
        handles.push(buffer.enqueue(i).await.unwrap());
    }
    let last = handles.pop().unwrap();

    let results: Vec<u32> = join_all(handles)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(results, vec![0, 2, 4, 6, 8, 10]);

    // The seventh item waits for shutdown
    assert_eq!(buffer.debug_snapshot().admitted_items, 1);
    shutdown.shutdown().await.unwrap();
    assert_eq!(last.await.unwrap(), 12);

    let mut sizes = batches.lock().clone();
    sizes.sort();
    assert_eq!(sizes, vec![1, 3, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_period_trigger_flushes_partial_batch() {
    let period = Duration::from_millis(100);
    let (buffer, batches) = recording_buffer(10, usize::MAX, period);
    let started = tokio::time::Instant::now();
    let shutdown = buffer.start().unwrap();

    let handle = buffer.enqueue(21).await.unwrap();
    assert_eq!(handle.await.unwrap(), 42);
    assert!(started.elapsed() >= period);
    assert_eq!(batches.lock().as_slice(), &[1]);

    shutdown.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_byte_trigger_flushes_before_capacity() {
    let (buffer, batches) = recording_buffer(100, 10, LONG);
    let shutdown = buffer.start().unwrap();

    let mut handles = Vec::new();
    for i in 0..3 {
        handles.push(buffer.enqueue(i).await.unwrap());
    }
    let results = tokio::time::timeout(Duration::from_secs(5), join_all(handles))
        .await
        .expect("byte trigger should flush");
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(batches.lock().as_slice(), &[3]);

    shutdown.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_ceiling_rejects_when_flush_stalls() {
    let gate = Arc::new(Semaphore::new(0));
    let flush_gate = Arc::clone(&gate);
    let buffer = BatchBuffer::new(
        BatchBufferOptions::new(
            "stalled",
            2,
            usize::MAX,
            LONG,
            move |items: Vec<u32>| {
                let gate = Arc::clone(&flush_gate);
                async move {
                    let _open = gate.acquire().await.map_err(|e| {
                        SchedulerError::Internal(e.to_string())
                    })?;
                    Ok(items)
                }
            },
            |_: &u32| 4,
        )
        .with_max_concurrent(1),
    )
    .unwrap();
    let shutdown = buffer.start().unwrap();

    // Ceiling is 50 x capacity
    let mut handles = Vec::new();
    for i in 0..100 {
        handles.push(buffer.enqueue(i).await.unwrap());
    }
    let err = buffer.enqueue(100).await.unwrap_err();
    assert!(err.is_resource_exhausted());
    assert_eq!(buffer.debug_snapshot().admitted_items, 100);

    gate.add_permits(1);
    shutdown.shutdown().await.unwrap();
    let results = join_all(handles).await;
    assert_eq!(results.len(), 100);
    assert!(results.iter().all(Result::is_ok));
}

#[tokio::test]
async fn test_panicking_flush_fails_only_its_batch() {
    let buffer = BatchBuffer::new(BatchBufferOptions::new(
        "panicky",
        2,
        usize::MAX,
        LONG,
        |items: Vec<u32>| async move {
            if items.contains(&13) {
                panic!("unlucky batch");
            }
            Ok(items)
        },
        |_: &u32| 4,
    ))
    .unwrap();
    let shutdown = buffer.start().unwrap();

    let mut handles = Vec::new();
    for item in [13, 1, 2, 3] {
        handles.push(buffer.enqueue(item).await.unwrap());
    }
    let results = join_all(handles).await;

    assert!(matches!(results[0], Err(SchedulerError::FlushPanicked(_))));
    assert!(matches!(results[1], Err(SchedulerError::FlushPanicked(_))));
    assert_eq!(results[2].as_ref().unwrap(), &2);
    assert_eq!(results[3].as_ref().unwrap(), &3);

    // The buffer keeps working after a panic
    let next = buffer.enqueue(4).await.unwrap();
    shutdown.shutdown().await.unwrap();
    assert_eq!(next.await.unwrap(), 4);
}

#[tokio::test]
async fn test_flush_error_reaches_every_item_in_batch() {
    let buffer = BatchBuffer::new(BatchBufferOptions::new(
        "failing",
        3,
        usize::MAX,
        LONG,
        |_items: Vec<u32>| async move {
            Err::<Vec<u32>, _>(SchedulerError::Database("connection reset".to_string()))
        },
        |_: &u32| 4,
    ))
    .unwrap();
    let shutdown = buffer.start().unwrap();

    let mut handles = Vec::new();
    for i in 0..3 {
        handles.push(buffer.enqueue(i).await.unwrap());
    }
    for result in join_all(handles).await {
        let err = result.unwrap_err();
        assert!(matches!(err, SchedulerError::Database(ref msg) if msg == "connection reset"));
    }

    shutdown.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_result_count_mismatch_is_an_error() {
    let buffer = BatchBuffer::new(BatchBufferOptions::new(
        "short",
        2,
        usize::MAX,
        LONG,
        |_items: Vec<u32>| async move { Ok(vec![1u32]) },
        |_: &u32| 4,
    ))
    .unwrap();
    let shutdown = buffer.start().unwrap();

    let first = buffer.enqueue(1).await.unwrap();
    let second = buffer.enqueue(2).await.unwrap();
    assert!(matches!(first.await, Err(SchedulerError::Internal(_))));
    assert!(matches!(second.await, Err(SchedulerError::Internal(_))));

    shutdown.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_flushes_never_exceed_limit() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (flush_running, flush_peak) = (Arc::clone(&running), Arc::clone(&peak));

    let buffer = BatchBuffer::new(
        BatchBufferOptions::new(
            "bounded",
            1,
            usize::MAX,
            LONG,
            move |items: Vec<u32>| {
                let running = Arc::clone(&flush_running);
                let peak = Arc::clone(&flush_peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(items)
                }
            },
            |_: &u32| 4,
        )
        .with_max_concurrent(2),
    )
    .unwrap();
    let shutdown = buffer.start().unwrap();

    let mut handles = Vec::new();
    for i in 0..10 {
        handles.push(buffer.enqueue(i).await.unwrap());
    }
    shutdown.shutdown().await.unwrap();

    let results = join_all(handles).await;
    assert!(results.iter().all(Result::is_ok));
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(running.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_shutdown_drains_and_rejects_new_items() {
    let (buffer, batches) = recording_buffer(100, usize::MAX, LONG);
    let shutdown = buffer.start().unwrap();

    let mut handles = Vec::new();
    for i in 0..5 {
        handles.push(buffer.enqueue(i).await.unwrap());
    }
    shutdown.shutdown().await.unwrap();

    let results: Vec<u32> = join_all(handles)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(results, vec![0, 2, 4, 6, 8]);
    assert_eq!(batches.lock().as_slice(), &[5]);

    let err = buffer.enqueue(5).await.unwrap_err();
    assert!(matches!(err, SchedulerError::BufferState(_)));
    // A second shutdown is a no-op
    buffer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queue_item_writer_returns_inserted_ids() {
    let fixture = TenantFixture::new();
    let config = BufferConfig {
        queue_item_capacity: 4,
        ..BufferConfig::default()
    };
    let writer = QueueItemWriter::start(fixture.storage_engine(), &config).unwrap();

    let writes = (0..6).map(|_| {
        writer.write(NewQueueItem::new(
            fixture.tenant_id,
            "default",
            Uuid::new_v4(),
            "svc:act",
        ))
    });
    let mut ids: Vec<i64> = join_all(writes).await.into_iter().map(Result::unwrap).collect();
    ids.sort();
    ids.dedup();

    assert_eq!(ids.len(), 6);
    assert_eq!(fixture.storage.row_count(fixture.tenant_id, QueueTable::Queue), 6);
    writer.shutdown().await.unwrap();
}
