//! Fixed-size batch fan-out.

use crate::error::{ErrorAggregator, SchedulerResult};
use futures::future::join_all;
use std::future::Future;

/// Split `items` into chunks of at most `batch_size` and run `f` on every
/// chunk concurrently. All chunks run to completion; their errors are
/// aggregated.
///
/// ```rust
/// use tasker_scheduler::scheduler::make_batched;
///
/// # tokio_test::block_on(async {
/// let result = make_batched(2, vec![1, 2, 3, 4, 5], |chunk| async move {
///     assert!(chunk.len() <= 2);
///     Ok(())
/// })
/// .await;
/// assert!(result.is_ok());
/// # });
/// ```
pub async fn make_batched<T, F, Fut>(batch_size: usize, items: Vec<T>, f: F) -> SchedulerResult<()>
where
    F: Fn(Vec<T>) -> Fut,
    Fut: Future<Output = SchedulerResult<()>>,
{
    if items.is_empty() {
        return Ok(());
    }

    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(batch_size));
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        batches.push(items.by_ref().take(batch_size).collect::<Vec<_>>());
    }

    let mut errors = ErrorAggregator::new();
    for result in join_all(batches.into_iter().map(&f)).await {
        errors.record(result);
    }
    errors.into_result()
}
