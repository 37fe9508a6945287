//! Bounded-parallelism worker pool shared by the Sweep and Latency engines
//! (spec §5: "each engine owns exactly one pool; pools are not shared").
//!
//! The pattern itself — `Semaphore` + `stream::iter(..).buffer_unordered(n)`
//! — mirrors the teacher's `resolve_proxies`/`ping_proxies`.

use std::sync::Arc;

use futures::stream::{self, StreamExt as _};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Run `worker` over every item in `items` with at most `concurrency`
/// in flight at once. If `cancel` fires, no new work is admitted past
/// items already dispatched; in-flight work still runs to completion
/// (callers apply their own timeout per spec §5's cancellation rule).
pub async fn run_bounded<T, R, F, Fut>(
    items: Vec<T>,
    concurrency: usize,
    cancel: CancellationToken,
    worker: F,
) -> Vec<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = R> + Send,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let worker = Arc::new(worker);

    stream::iter(items)
        .take_while(|_| {
            let cancel = cancel.clone();
            async move { !cancel.is_cancelled() }
        })
        .map(|item| {
            let permit = Arc::clone(&semaphore);
            let worker = Arc::clone(&worker);
            async move {
                let _permit = permit.acquire().await;
                worker(item).await
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_every_item_exactly_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let items: Vec<usize> = (0..50).collect();
        let c = Arc::clone(&counter);
        let results = run_bounded(items, 8, CancellationToken::new(), move |item| {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                item * 2
            }
        })
        .await;
        assert_eq!(results.len(), 50);
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[tokio::test]
    async fn cancellation_stops_admitting_new_work() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let items: Vec<usize> = (0..10).collect();
        let results = run_bounded(items, 4, cancel, |item| async move { item }).await;
        assert!(results.is_empty());
    }
}
