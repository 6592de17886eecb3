//! Fixed-size cooperative worker pool over a shared cursor.
//!
//! Workers are plain futures polled together on the calling task, so nothing
//! here spawns threads. Each worker claims the next index with an atomic
//! increment, awaits that task, records the outcome against the index and
//! goes back for more until the cursor runs past the end. A failed task is
//! just another outcome; it never stops a worker.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::join_all;

/// Outbound fan-out used for customer mutations.
pub const DEFAULT_CONCURRENCY: usize = 8;

pub async fn run_bounded<T, E, Fut>(tasks: Vec<Fut>, concurrency: usize) -> Vec<Result<T, E>>
where
    Fut: Future<Output = Result<T, E>>,
{
    run_bounded_with(tasks, concurrency, |_, _| {}).await
}

/// Like [`run_bounded`], calling `on_settled(index, outcome)` as each task
/// finishes. Results come back in task order whatever the completion order.
pub async fn run_bounded_with<T, E, Fut, F>(
    tasks: Vec<Fut>,
    concurrency: usize,
    on_settled: F,
) -> Vec<Result<T, E>>
where
    Fut: Future<Output = Result<T, E>>,
    F: Fn(usize, &Result<T, E>),
{
    let total = tasks.len();
    let slots: Vec<Mutex<Option<Fut>>> = tasks.into_iter().map(|t| Mutex::new(Some(t))).collect();
    let cursor = AtomicUsize::new(0);

    let slots = &slots;
    let cursor = &cursor;
    let on_settled = &on_settled;

    let workers = (0..concurrency.max(1)).map(move |_| async move {
        let mut settled = Vec::new();
        loop {
            let index = cursor.fetch_add(1, Ordering::SeqCst);
            if index >= total {
                break;
            }
            let task = slots[index].lock().ok().and_then(|mut slot| slot.take());
            let Some(task) = task else {
                continue;
            };
            let outcome = task.await;
            on_settled(index, &outcome);
            settled.push((index, outcome));
        }
        settled
    });

    let mut ordered: Vec<Option<Result<T, E>>> = (0..total).map(|_| None).collect();
    for (index, outcome) in join_all(workers).await.into_iter().flatten() {
        ordered[index] = Some(outcome);
    }

    let results: Vec<Result<T, E>> = ordered.into_iter().flatten().collect();
    debug_assert_eq!(results.len(), total);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Duration;

    #[tokio::test]
    async fn result_count_matches_task_count() {
        for (n, k) in [(0usize, 1usize), (1, 1), (5, 2), (3, 8), (20, 8), (7, 0)] {
            let tasks = (0..n).map(|i| async move { Ok::<usize, ()>(i) }).collect();
            let results = run_bounded(tasks, k).await;
            assert_eq!(results.len(), n, "n={n} k={k}");
        }
    }

    #[tokio::test]
    async fn results_keep_task_order_despite_completion_order() {
        // Earlier tasks sleep longer so they finish last.
        let tasks = (0..10u64)
            .map(|i| async move {
                tokio::time::sleep(Duration::from_millis(50 - i * 5)).await;
                Ok::<u64, ()>(i)
            })
            .collect();
        let results = run_bounded(tasks, 4).await;
        let values: Vec<u64> = results.into_iter().map(|r| r.expect("ok")).collect();
        assert_eq!(values, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failures_do_not_block_other_tasks() {
        let tasks = (0..12usize)
            .map(|i| async move {
                if i % 3 == 0 {
                    Err(format!("task {i} failed"))
                } else {
                    Ok(i)
                }
            })
            .collect();
        let results = run_bounded(tasks, 3).await;
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 4);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 8);
        assert_eq!(results[3], Err("task 3 failed".to_string()));
        assert_eq!(results[4], Ok(4));
    }

    #[tokio::test]
    async fn never_exceeds_concurrency() {
        let in_flight = Cell::new(0usize);
        let peak = Cell::new(0usize);
        let in_flight = &in_flight;
        let peak = &peak;

        let tasks = (0..30)
            .map(move |_| async move {
                in_flight.set(in_flight.get() + 1);
                peak.set(peak.get().max(in_flight.get()));
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.set(in_flight.get() - 1);
                Ok::<(), ()>(())
            })
            .collect();
        run_bounded(tasks, 3).await;
        assert_eq!(peak.get(), 3);
        assert_eq!(in_flight.get(), 0);
    }

    #[tokio::test]
    async fn observer_sees_every_settlement_once() {
        let seen = Mutex::new(Vec::new());
        let tasks = (0..9usize).map(|i| async move { Ok::<usize, ()>(i) }).collect();
        run_bounded_with(tasks, 2, |index, outcome| {
            assert_eq!(outcome, &Ok(index));
            seen.lock().expect("lock").push(index);
        })
        .await;
        let mut seen = seen.into_inner().expect("lock");
        seen.sort_unstable();
        assert_eq!(seen, (0..9).collect::<Vec<_>>());
    }
}
