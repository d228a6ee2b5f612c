//! Bounded parallel fan-out for I/O-bound stages.
//!
//! Canonicalization, embedding batches, summarization, and QFS Map all fan
//! out over a bounded pool. Completion order is unspecified; callers that
//! need determinism re-sort by their own keys afterwards.

use futures::StreamExt;
use futures::stream;

/// Map `f` over `items` with at most `parallelism` tasks in flight.
///
/// Results come back in completion order. A `parallelism` of 0 means
/// auto-detect from the CPU count.
pub async fn map_bounded<I, T, U, F, Fut>(items: I, parallelism: usize, f: F) -> Vec<U>
where
    I: IntoIterator<Item = T>,
    F: Fn(T) -> Fut,
    Fut: Future<Output = U>,
{
    let parallelism = if parallelism == 0 {
        num_cpus::get()
    } else {
        parallelism
    };
    stream::iter(items.into_iter().map(f))
        .buffer_unordered(parallelism)
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_map_bounded_runs_all_items() {
        let out = map_bounded(0..20, 4, |i| async move { i * 2 }).await;
        let mut sorted = out.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..20).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_map_bounded_respects_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let _ = map_bounded(0..32, 3, |_| {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }
}
