//! Bounded fan-out/fan-in over a list of work items
//!
//! Every item is dispatched exactly once and its result lands in the slot
//! matching its input position, so callers can write results back by index
//! without any shared mutable state between workers.

use std::future::Future;

use futures::StreamExt;

/// Clamp a requested worker count to `[1, len]`
pub fn effective_workers(requested: usize, len: usize) -> usize {
    requested.min(len).max(1)
}

/// Run `worker` over `items` with at most `workers` in flight at once
///
/// Resolves only after every item has completed. The returned vector is in
/// input order regardless of completion order.
pub async fn parallel_map<I, T, R, F, Fut>(items: I, workers: usize, worker: F) -> Vec<R>
where
    I: IntoIterator<Item = T>,
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    let items: Vec<T> = items.into_iter().collect();
    let len = items.len();
    if len == 0 {
        return Vec::new();
    }

    let mut slots: Vec<Option<R>> = (0..len).map(|_| None).collect();
    let mut completed = futures::stream::iter(items.into_iter().enumerate())
        .map(|(index, item)| {
            let fut = worker(item);
            async move { (index, fut.await) }
        })
        .buffer_unordered(effective_workers(workers, len));

    while let Some((index, result)) = completed.next().await {
        debug_assert!(slots[index].is_none(), "index {} dispatched twice", index);
        slots[index] = Some(result);
    }

    let results: Vec<R> = slots.into_iter().flatten().collect();
    debug_assert_eq!(results.len(), len);
    results
}
