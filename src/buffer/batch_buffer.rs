//! # Batch Buffer
//!
//! Generic write-amplification reducer: producers enqueue single items and
//! get a per-item completion handle; a background loop groups items into
//! batches and hands each batch to a bulk flush function.
//!
//! ## Flush triggers
//!
//! A flush starts when the accumulation list reaches `capacity` items, when
//! the accumulated size estimate reaches `max_bytes`, or when `flush_period`
//! has elapsed since the last flush. A flush takes at most `capacity` items,
//! oldest first; the remainder waits for the next trigger.
//!
//! ## Backpressure
//!
//! - At most `max_concurrent` flushes run at once. A trigger that cannot get
//!   a flush token within `flush_wait` is skipped; its items stay resident.
//! - Admission fails with [`SchedulerError::ResourceExhausted`] once the
//!   resident count (admitted and not yet resolved) reaches
//!   `ceiling_multiplier * capacity`, or when the ingestion channel does not
//!   accept the item within `enqueue_wait`.
//!
//! ## Completion
//!
//! Every admitted item resolves exactly once: with its own output, with the
//! batch's error, or with [`SchedulerError::FlushPanicked`] when the flush
//! function panics. Shutdown force-flushes everything still resident and
//! waits for in-flight flushes before returning.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tasker_scheduler::buffer::{BatchBuffer, BatchBufferOptions};
//!
//! # async fn example() -> tasker_scheduler::error::SchedulerResult<()> {
//! let buffer = BatchBuffer::new(BatchBufferOptions::new(
//!     "events",
//!     100,
//!     1024 * 1024,
//!     Duration::from_millis(10),
//!     |items: Vec<String>| async move { Ok(items.iter().map(|s| s.len()).collect()) },
//!     |item: &String| item.len(),
//! ))?;
//!
//! let shutdown = buffer.start()?;
//! let len = buffer.enqueue("hello".to_string()).await?.await?;
//! assert_eq!(len, 5);
//! shutdown.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::BufferConfig;
use crate::constants::defaults;
use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::operation_pool::panic_message;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Bulk writer: one output per input, in input order.
pub type FlushFn<T, U> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, SchedulerResult<Vec<U>>> + Send + Sync>;

/// Per-item size estimate in bytes.
pub type SizeFn<T> = Arc<dyn Fn(&T) -> usize + Send + Sync>;

/// Construction options for [`BatchBuffer`].
pub struct BatchBufferOptions<T, U> {
    pub name: String,
    /// Items per flush (> 0)
    pub capacity: usize,
    /// Accumulated size that triggers a flush (> 0)
    pub max_bytes: usize,
    /// Longest time between flushes (> 0)
    pub flush_period: Duration,
    pub flush: FlushFn<T, U>,
    pub size: SizeFn<T>,
    pub max_concurrent: usize,
    pub flush_wait: Duration,
    pub enqueue_wait: Duration,
    pub ceiling_multiplier: usize,
}

impl<T, U> BatchBufferOptions<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    pub fn new<F, Fut, S>(
        name: impl Into<String>,
        capacity: usize,
        max_bytes: usize,
        flush_period: Duration,
        flush: F,
        size: S,
    ) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SchedulerResult<Vec<U>>> + Send + 'static,
        S: Fn(&T) -> usize + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            capacity,
            max_bytes,
            flush_period,
            flush: Arc::new(move |items| Box::pin(flush(items))),
            size: Arc::new(size),
            max_concurrent: defaults::BUFFER_MAX_CONCURRENT_FLUSHES,
            flush_wait: defaults::BUFFER_FLUSH_WAIT,
            enqueue_wait: defaults::BUFFER_ENQUEUE_WAIT,
            ceiling_multiplier: defaults::BUFFER_CEILING_MULTIPLIER,
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_flush_wait(mut self, flush_wait: Duration) -> Self {
        self.flush_wait = flush_wait;
        self
    }

    pub fn with_enqueue_wait(mut self, enqueue_wait: Duration) -> Self {
        self.enqueue_wait = enqueue_wait;
        self
    }

    /// Apply the concurrency and admission settings of a [`BufferConfig`].
    pub fn with_buffer_config(self, config: &BufferConfig) -> Self {
        let mut options = self
            .with_max_concurrent(config.max_concurrent_flushes)
            .with_flush_wait(config.flush_wait())
            .with_enqueue_wait(config.enqueue_wait());
        options.ceiling_multiplier = config.ceiling_multiplier;
        options
    }

    fn validate(&self) -> SchedulerResult<()> {
        let mut problems = Vec::new();
        if self.name.trim().is_empty() {
            problems.push("name is required");
        }
        if self.capacity == 0 {
            problems.push("capacity must be > 0");
        }
        if self.max_bytes == 0 {
            problems.push("max_bytes must be > 0");
        }
        if self.flush_period.is_zero() {
            problems.push("flush_period must be > 0");
        }
        if self.max_concurrent == 0 {
            problems.push("max_concurrent must be > 0");
        }
        if self.flush_wait.is_zero() {
            problems.push("flush_wait must be > 0");
        }
        if self.ceiling_multiplier == 0 {
            problems.push("ceiling_multiplier must be > 0");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(SchedulerError::Configuration(format!(
                "invalid batch buffer options: {}",
                problems.join("; ")
            )))
        }
    }
}

/// Lifecycle of a buffer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLifecycle {
    Initialized,
    Started,
    Finished,
}

impl fmt::Display for BufferLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferLifecycle::Initialized => f.write_str("initialized"),
            BufferLifecycle::Started => f.write_str("started"),
            BufferLifecycle::Finished => f.write_str("finished"),
        }
    }
}

/// One flush currently running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightFlush {
    pub flush_id: Uuid,
    pub items: usize,
    pub started_at: DateTime<Utc>,
}

/// Point-in-time view of a buffer, logged when a flush cannot get a token.
#[derive(Debug, Clone)]
pub struct BufferDebugSnapshot {
    pub name: String,
    pub state: BufferLifecycle,
    /// Items in the accumulation list
    pub resident_items: usize,
    pub resident_bytes: usize,
    /// Items admitted and not yet resolved, including in-flight ones
    pub admitted_items: usize,
    pub in_flight: Vec<InFlightFlush>,
    pub last_flush_at: DateTime<Utc>,
    pub capacity: usize,
    pub max_bytes: usize,
    pub flush_period: Duration,
    pub flush_wait: Duration,
    pub max_concurrent: usize,
}

impl fmt::Display for BufferDebugSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "============= Buffer {} =============", self.name)?;
        writeln!(f, "{} items in buffer ({} bytes)", self.resident_items, self.resident_bytes)?;
        writeln!(f, "{} items admitted and unresolved", self.admitted_items)?;
        writeln!(f, "Last flushed at {}", self.last_flush_at.to_rfc3339())?;
        writeln!(f, "{} max capacity", self.capacity)?;
        writeln!(f, "{} max data size in queue", self.max_bytes)?;
        writeln!(f, "{:?} flush period", self.flush_period)?;
        writeln!(f, "{:?} wait for flush", self.flush_wait)?;
        writeln!(f, "{} max concurrent", self.max_concurrent)?;
        writeln!(f, "In state {}", self.state)?;
        writeln!(f, "{} currently flushing", self.in_flight.len())?;
        for flush in &self.in_flight {
            writeln!(
                f,
                "{} flushing {} items since {}",
                flush.flush_id,
                flush.items,
                flush.started_at.to_rfc3339()
            )?;
        }
        write!(f, "=====================================")
    }
}

/// Completion handle for one enqueued item. Resolves exactly once.
#[derive(Debug)]
pub struct FlushHandle<U> {
    receiver: oneshot::Receiver<SchedulerResult<U>>,
}

impl<U> Future for FlushHandle<U> {
    type Output = SchedulerResult<U>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(SchedulerError::BufferState(
                    "flush result was dropped before completion".to_string(),
                ))
            })
        })
    }
}

struct Pending<T, U> {
    item: T,
    size: usize,
    done: oneshot::Sender<SchedulerResult<U>>,
}

struct BufferState<T, U> {
    lifecycle: BufferLifecycle,
    resident: VecDeque<Pending<T, U>>,
    resident_bytes: usize,
    last_flush: Instant,
    last_flush_at: DateTime<Utc>,
    in_flight: HashMap<Uuid, InFlightFlush>,
    receiver: Option<mpsc::Receiver<Pending<T, U>>>,
    worker: Option<JoinHandle<()>>,
}

struct Inner<T, U> {
    name: String,
    capacity: usize,
    max_bytes: usize,
    flush_period: Duration,
    flush: FlushFn<T, U>,
    size: SizeFn<T>,
    max_concurrent: usize,
    flush_wait: Duration,
    enqueue_wait: Duration,
    ceiling: usize,
    sender: mpsc::Sender<Pending<T, U>>,
    tokens: Arc<Semaphore>,
    /// Admitted and not yet resolved
    admitted: AtomicUsize,
    stop: watch::Sender<bool>,
    state: Mutex<BufferState<T, U>>,
}

/// Bounded, concurrent batching buffer. Cheap to clone.
pub struct BatchBuffer<T, U> {
    inner: Arc<Inner<T, U>>,
}

impl<T, U> Clone for BatchBuffer<T, U> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Returned by [`BatchBuffer::start`].
pub struct BufferShutdown<T, U> {
    inner: Arc<Inner<T, U>>,
}

impl<T, U> BufferShutdown<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    /// Flush every resident item and wait for all in-flight flushes.
    pub async fn shutdown(self) -> SchedulerResult<()> {
        Inner::shutdown(&self.inner).await
    }
}

impl<T, U> BatchBuffer<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    pub fn new(options: BatchBufferOptions<T, U>) -> SchedulerResult<Self> {
        options.validate()?;

        let channel_size = options.capacity.max(defaults::BUFFER_MIN_CHANNEL_SIZE);
        let (sender, receiver) = mpsc::channel(channel_size);
        let (stop, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                ceiling: options.capacity.saturating_mul(options.ceiling_multiplier),
                name: options.name,
                capacity: options.capacity,
                max_bytes: options.max_bytes,
                flush_period: options.flush_period,
                flush: options.flush,
                size: options.size,
                max_concurrent: options.max_concurrent,
                flush_wait: options.flush_wait,
                enqueue_wait: options.enqueue_wait,
                sender,
                tokens: Arc::new(Semaphore::new(options.max_concurrent)),
                admitted: AtomicUsize::new(0),
                stop,
                state: Mutex::new(BufferState {
                    lifecycle: BufferLifecycle::Initialized,
                    resident: VecDeque::new(),
                    resident_bytes: 0,
                    last_flush: Instant::now(),
                    last_flush_at: Utc::now(),
                    in_flight: HashMap::new(),
                    receiver: Some(receiver),
                    worker: None,
                }),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Begin accepting items. Starting twice is an error.
    pub fn start(&self) -> SchedulerResult<BufferShutdown<T, U>> {
        let mut state = self.inner.state.lock();
        if state.lifecycle != BufferLifecycle::Initialized {
            return Err(SchedulerError::BufferState(format!(
                "buffer {} already started",
                self.inner.name
            )));
        }

        let receiver = state.receiver.take().ok_or_else(|| {
            SchedulerError::BufferState(format!("buffer {} has no ingestion channel", self.inner.name))
        })?;

        state.lifecycle = BufferLifecycle::Started;
        state.last_flush = Instant::now();
        state.last_flush_at = Utc::now();
        state.worker = Some(tokio::spawn(Inner::run(
            Arc::clone(&self.inner),
            receiver,
            self.inner.stop.subscribe(),
        )));

        debug!(buffer = %self.inner.name, "Starting buffer");
        Ok(BufferShutdown {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Admit one item. Never blocks longer than the enqueue wait.
    pub async fn enqueue(&self, item: T) -> SchedulerResult<FlushHandle<U>> {
        let inner = &self.inner;

        let lifecycle = inner.state.lock().lifecycle;
        if lifecycle != BufferLifecycle::Started {
            return Err(SchedulerError::BufferState(format!(
                "buffer {} not ready, in state '{lifecycle}'",
                inner.name
            )));
        }

        let admitted = inner.admitted.fetch_add(1, Ordering::AcqRel);
        if admitted >= inner.ceiling {
            inner.admitted.fetch_sub(1, Ordering::AcqRel);
            return Err(SchedulerError::resource_exhausted(format!(
                "buffer {} is out of space ({admitted} items)",
                inner.name
            )));
        }

        if admitted > inner.capacity * defaults::BUFFER_BACKLOG_WARN_MULTIPLIER
            && admitted % 1000 == 0
        {
            warn!(buffer = %inner.name, items = admitted, "Buffer is backed up");
        }

        let size = (inner.size)(&item);
        let (done, receiver) = oneshot::channel();
        let pending = Pending { item, size, done };

        match inner.sender.send_timeout(pending, inner.enqueue_wait).await {
            Ok(()) => Ok(FlushHandle { receiver }),
            Err(SendTimeoutError::Timeout(_)) => {
                inner.admitted.fetch_sub(1, Ordering::AcqRel);
                Err(SchedulerError::resource_exhausted(format!(
                    "timeout waiting for buffer {}",
                    inner.name
                )))
            }
            Err(SendTimeoutError::Closed(_)) => {
                inner.admitted.fetch_sub(1, Ordering::AcqRel);
                Err(SchedulerError::BufferState(format!(
                    "buffer {} is closed",
                    inner.name
                )))
            }
        }
    }

    pub fn debug_snapshot(&self) -> BufferDebugSnapshot {
        self.inner.debug_snapshot()
    }

    /// Same as the handle returned by `start`.
    pub async fn shutdown(&self) -> SchedulerResult<()> {
        Inner::shutdown(&self.inner).await
    }
}

impl<T, U> Inner<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    async fn run(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<Pending<T, U>>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            let deadline = self.state.lock().last_flush + self.flush_period;

            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                received = receiver.recv() => match received {
                    Some(pending) => {
                        let should_flush = self.push(pending);
                        if should_flush {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    self.flush().await;
                }
            }
        }

        // Items sent before the channel closed are still owed a flush.
        receiver.close();
        while let Ok(pending) = receiver.try_recv() {
            self.push(pending);
        }
        debug!(buffer = %self.name, "Buffer worker stopped");
    }

    /// Append to the accumulation list; true when a size trigger fired.
    fn push(&self, pending: Pending<T, U>) -> bool {
        let mut state = self.state.lock();
        state.resident_bytes += pending.size;
        state.resident.push_back(pending);
        state.resident.len() >= self.capacity || state.resident_bytes >= self.max_bytes
    }

    /// Triggered flush: skipped if no token frees up within `flush_wait`.
    async fn flush(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.last_flush = Instant::now();
            state.last_flush_at = Utc::now();
        }

        let permit = match tokio::time::timeout(
            self.flush_wait,
            Arc::clone(&self.tokens).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return,
            Err(_) => {
                warn!(
                    buffer = %self.name,
                    flush_wait_ms = self.flush_wait.as_millis() as u64,
                    snapshot = %self.debug_snapshot(),
                    "Could not acquire flush token"
                );
                return;
            }
        };

        self.spawn_flush(permit);
    }

    /// Take up to `capacity` items and flush them on their own task.
    /// Returns false when there was nothing to flush.
    fn spawn_flush(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> bool {
        let flush_id = Uuid::new_v4();
        let batch: Vec<Pending<T, U>> = {
            let mut state = self.state.lock();
            let take = state.resident.len().min(self.capacity);
            if take == 0 {
                return false;
            }
            let batch: Vec<_> = state.resident.drain(..take).collect();
            state.resident_bytes -= batch.iter().map(|p| p.size).sum::<usize>();
            state.in_flight.insert(
                flush_id,
                InFlightFlush {
                    flush_id,
                    items: batch.len(),
                    started_at: Utc::now(),
                },
            );
            batch
        };

        tokio::spawn(Arc::clone(self).execute_flush(flush_id, batch, permit));
        true
    }

    async fn execute_flush(
        self: Arc<Self>,
        flush_id: Uuid,
        batch: Vec<Pending<T, U>>,
        permit: OwnedSemaphorePermit,
    ) {
        let count = batch.len();
        let mut items = Vec::with_capacity(count);
        let mut waiters = Vec::with_capacity(count);
        for pending in batch {
            items.push(pending.item);
            waiters.push(pending.done);
        }

        let outcome = AssertUnwindSafe((self.flush)(items)).catch_unwind().await;

        match outcome {
            Ok(Ok(results)) if results.len() == count => {
                for (waiter, result) in waiters.into_iter().zip(results) {
                    self.resolve(waiter, Ok(result));
                }
                debug!(buffer = %self.name, flush_id = %flush_id, items = count, "Flushed items");
            }
            Ok(Ok(results)) => {
                let err = SchedulerError::Internal(format!(
                    "[{}] flush returned {} results for {count} items",
                    self.name,
                    results.len()
                ));
                error!(buffer = %self.name, flush_id = %flush_id, error = %err, "Flush result mismatch");
                for waiter in waiters {
                    self.resolve(waiter, Err(err.clone()));
                }
            }
            Ok(Err(err)) => {
                debug!(buffer = %self.name, flush_id = %flush_id, error = %err, "Flush failed");
                for waiter in waiters {
                    self.resolve(waiter, Err(err.clone()));
                }
            }
            Err(panic) => {
                let err = SchedulerError::FlushPanicked(format!(
                    "[{}] panic recovered in flush: {}",
                    self.name,
                    panic_message(panic.as_ref())
                ));
                error!(
                    buffer = %self.name,
                    flush_id = %flush_id,
                    error = %err,
                    stack = %std::backtrace::Backtrace::force_capture(),
                    "Panic recovered in flush"
                );
                for waiter in waiters {
                    self.resolve(waiter, Err(err.clone()));
                }
            }
        }

        self.state.lock().in_flight.remove(&flush_id);
        drop(permit);
    }

    fn resolve(&self, waiter: oneshot::Sender<SchedulerResult<U>>, result: SchedulerResult<U>) {
        self.admitted.fetch_sub(1, Ordering::AcqRel);
        if waiter.send(result).is_err() {
            debug!(buffer = %self.name, "Caller dropped its flush handle");
        }
    }

    #[instrument(skip(self), fields(buffer = %self.name))]
    async fn shutdown(self: &Arc<Self>) -> SchedulerResult<()> {
        let worker = {
            let mut state = self.state.lock();
            if state.lifecycle == BufferLifecycle::Finished {
                return Ok(());
            }
            state.lifecycle = BufferLifecycle::Finished;
            state.worker.take()
        };

        let _ = self.stop.send(true);
        if let Some(worker) = worker {
            worker.await.map_err(|e| {
                SchedulerError::BufferState(format!("buffer {} worker failed: {e}", self.name))
            })?;
        }

        // Forced flushes: wait for a token instead of skipping.
        loop {
            let permit = Arc::clone(&self.tokens).acquire_owned().await.map_err(|_| {
                SchedulerError::BufferState(format!("buffer {} flush tokens closed", self.name))
            })?;
            if !self.spawn_flush(permit) {
                break;
            }
        }

        let in_flight = self.state.lock().in_flight.len();
        if in_flight > 0 {
            info!(buffer = %self.name, in_flight = in_flight, "cleanup: waiting for flushes to finish");
        }

        // Holding every token means no flush is running.
        let all = u32::try_from(self.max_concurrent).unwrap_or(u32::MAX);
        let _all_tokens = self.tokens.acquire_many(all).await.map_err(|_| {
            SchedulerError::BufferState(format!("buffer {} flush tokens closed", self.name))
        })?;
        self.tokens.close();

        debug!(buffer = %self.name, "Buffer shut down");
        Ok(())
    }

    fn debug_snapshot(&self) -> BufferDebugSnapshot {
        let state = self.state.lock();
        let mut in_flight: Vec<InFlightFlush> = state.in_flight.values().cloned().collect();
        in_flight.sort_by_key(|f| f.started_at);

        BufferDebugSnapshot {
            name: self.name.clone(),
            state: state.lifecycle,
            resident_items: state.resident.len(),
            resident_bytes: state.resident_bytes,
            admitted_items: self.admitted.load(Ordering::Acquire),
            in_flight,
            last_flush_at: state.last_flush_at,
            capacity: self.capacity,
            max_bytes: self.max_bytes,
            flush_period: self.flush_period,
            flush_wait: self.flush_wait,
            max_concurrent: self.max_concurrent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_buffer(capacity: usize, period: Duration) -> BatchBuffer<u32, u32> {
        BatchBuffer::new(BatchBufferOptions::new(
            "echo",
            capacity,
            usize::MAX,
            period,
            |items: Vec<u32>| async move { Ok(items.into_iter().map(|i| i * 2).collect()) },
            |_: &u32| 4,
        ))
        .unwrap()
    }

    #[test]
    fn test_invalid_options_rejected() {
        let result = BatchBuffer::<u32, u32>::new(BatchBufferOptions::new(
            "",
            0,
            0,
            Duration::ZERO,
            |items: Vec<u32>| async move { Ok(items) },
            |_: &u32| 1,
        ));
        let err = result.err().unwrap();
        assert!(matches!(err, SchedulerError::Configuration(_)));
        assert!(err.to_string().contains("capacity must be > 0"));
    }

    #[tokio::test]
    async fn test_enqueue_before_start_fails() {
        let buffer = echo_buffer(10, Duration::from_millis(10));
        let err = buffer.enqueue(1).await.err().unwrap();
        assert!(matches!(err, SchedulerError::BufferState(_)));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let buffer = echo_buffer(10, Duration::from_millis(10));
        let shutdown = buffer.start().unwrap();
        assert!(buffer.start().is_err());
        shutdown.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_item_resolves_with_its_output() {
        let buffer = echo_buffer(10, Duration::from_millis(5));
        let shutdown = buffer.start().unwrap();

        let handle = buffer.enqueue(21).await.unwrap();
        assert_eq!(handle.await.unwrap(), 42);

        shutdown.shutdown().await.unwrap();
        let err = buffer.enqueue(1).await.err().unwrap();
        assert!(matches!(err, SchedulerError::BufferState(_)));
    }

    #[tokio::test]
    async fn test_snapshot_reports_configuration() {
        let buffer = echo_buffer(7, Duration::from_secs(60));
        let snapshot = buffer.debug_snapshot();
        assert_eq!(snapshot.capacity, 7);
        assert_eq!(snapshot.state, BufferLifecycle::Initialized);
        assert_eq!(snapshot.max_concurrent, 50);
        assert!(snapshot.to_string().contains("7 max capacity"));
    }
}
