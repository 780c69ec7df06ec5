//! Bounded-concurrency execution of independent work units.
//!
//! Both entry points send every unit at most once, never keep more than `limit` units in
//! flight and return results in unit order. The first failure aborts the dispatch: the
//! async variant drops (cancels) the units still in flight, the blocking variant stops
//! handing out new units and waits for the running ones.

use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// Runs `send` over `units` with at most `limit` futures in flight.
pub async fn dispatch<U, T, E, F, Fut>(units: Vec<U>, limit: usize, send: F) -> Result<Vec<T>, E>
where
    F: Fn(U) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let limit = limit.max(1);
    tracing::debug!(units = units.len(), limit, "dispatching");
    stream::iter(units)
        .map(send)
        .buffered(limit)
        .try_collect()
        .await
}

/// Runs `send` over `units` on at most `limit` scoped worker threads.
pub fn dispatch_blocking<U, T, E, F>(units: Vec<U>, limit: usize, send: F) -> Result<Vec<T>, E>
where
    U: Send,
    T: Send,
    E: Send,
    F: Fn(U) -> Result<T, E> + Sync,
{
    let total = units.len();
    let workers = limit.max(1).min(total);
    tracing::debug!(units = total, workers, "dispatching on worker threads");
    if workers <= 1 {
        return units.into_iter().map(send).collect();
    }

    let queue: Mutex<VecDeque<(usize, U)>> = Mutex::new(units.into_iter().enumerate().collect());
    let results: Mutex<Vec<Option<T>>> = Mutex::new((0..total).map(|_| None).collect());
    let failure: Mutex<Option<(usize, E)>> = Mutex::new(None);
    let stop = AtomicBool::new(false);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let next = queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop_front();
                let Some((index, unit)) = next else {
                    break;
                };
                match send(unit) {
                    Ok(value) => {
                        results.lock().unwrap_or_else(PoisonError::into_inner)[index] = Some(value);
                    }
                    Err(error) => {
                        stop.store(true, Ordering::SeqCst);
                        let mut failure = failure.lock().unwrap_or_else(PoisonError::into_inner);
                        // Keep the failure of the earliest unit.
                        if failure.as_ref().map_or(true, |(first, _)| index < *first) {
                            *failure = Some((index, error));
                        }
                    }
                }
            });
        }
    });

    if let Some((_, error)) = failure.into_inner().unwrap_or_else(PoisonError::into_inner) {
        return Err(error);
    }
    Ok(results
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
        .into_iter()
        .flatten()
        .collect())
}
