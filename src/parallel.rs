//! Fan-out execution of independent units of work.

use std::future::Future;

use anyhow::anyhow;
use log::debug;

use crate::errors::{AggregateError, UnitFailure};

/// Outcome of one unit, observed exactly once.
pub type WorkResult<T> = anyhow::Result<T>;

/// Runs `work(index, item)` for every item concurrently on its own task and
/// waits for all of them.
///
/// Every unit reports exactly once, including units that panic, so a fault
/// in one never hides the outcome of the others. On success the outputs are
/// returned in submission order; otherwise the error names every failing
/// index. No workers are spawned for an empty list.
pub async fn run_parallel<I, T, F, Fut>(
    title: &str,
    items: Vec<I>,
    work: F,
) -> Result<Vec<T>, AggregateError>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(usize, I) -> Fut,
    Fut: Future<Output = WorkResult<T>> + Send + 'static,
{
    debug!("{}: {} unit(s)", title, items.len());
    if items.is_empty() {
        return Ok(Vec::new());
    }

    let handles: Vec<_> = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| tokio::spawn(work(index, item)))
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(match handle.await {
            Ok(result) => result,
            Err(join_err) => Err(anyhow!("unit aborted: {}", join_err)),
        });
    }
    collect_results(title, results)
}

/// Folds per-unit results into the outputs, or into one error naming every
/// failed index.
pub fn collect_results<T>(
    title: &str,
    results: Vec<WorkResult<T>>,
) -> Result<Vec<T>, AggregateError> {
    let total = results.len();
    let mut outputs = Vec::with_capacity(total);
    let mut failures = Vec::new();
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(output) => outputs.push(output),
            Err(err) => failures.push(UnitFailure {
                index,
                message: format!("{:#}", err),
            }),
        }
    }

    if failures.is_empty() {
        Ok(outputs)
    } else {
        Err(AggregateError::new(title, total, outputs.len(), failures))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::bail;

    use super::*;

    #[tokio::test]
    async fn empty_input_spawns_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let outputs = run_parallel("noop", Vec::<u32>::new(), move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await
        .unwrap();
        assert!(outputs.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn outputs_follow_submission_order() {
        let outputs = run_parallel("square", vec![5u64, 1, 3], |_, value| async move {
            tokio::time::sleep(Duration::from_millis(value * 5)).await;
            Ok(value * value)
        })
        .await
        .unwrap();
        assert_eq!(outputs, vec![25, 1, 9]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failure_counts_match_failing_units() {
        for total in 0..12usize {
            let items: Vec<usize> = (0..total).collect();
            let expected: Vec<usize> = items.iter().copied().filter(|i| i % 3 == 1).collect();
            let result = run_parallel("mixed", items, |index, item| async move {
                // reverse completion order
                tokio::time::sleep(Duration::from_millis((12 - index as u64) * 2)).await;
                if item % 3 == 1 {
                    bail!("unit {} failed", item);
                }
                Ok(item)
            })
            .await;
            match result {
                Ok(outputs) => {
                    assert!(expected.is_empty());
                    assert_eq!(outputs.len(), total);
                }
                Err(err) => {
                    assert_eq!(err.failed_indices(), expected);
                    assert_eq!(err.succeeded(), total - expected.len());
                    assert_eq!(err.total(), total);
                }
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_unit_is_reported_without_losing_siblings() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        let err = run_parallel("panics", vec![0, 1, 2], move |index, _: i32| {
            let counter = counter.clone();
            async move {
                if index == 1 {
                    panic!("unit exploded");
                }
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap_err();
        assert_eq!(err.failed_indices(), vec![1]);
        assert_eq!(err.succeeded(), 2);
        assert_eq!(finished.load(Ordering::SeqCst), 2);
        assert!(err.failures()[0].message.starts_with("unit aborted"));
    }
}
