//! Consumers for producer channels of [`BatchResult`]s.
//!
//! Upstream errors are collected while the channel is drained and returned
//! together once it closes. A handler failure is fatal and returned at once;
//! dropping the receiver then tells the producer to stop.

use super::batch::BatchResult;
use allocd_core::{Error, Result};
use core::future::Future;
use tokio::sync::mpsc;

/// Feeds every successful batch of `results` to `handle`, in order.
///
/// # Errors
///
/// - The first error returned by `handle`, immediately.
/// - Otherwise an [`Error::Aggregate`] of every upstream error, once the
///   channel closes.
pub async fn drain<T, F, Fut>(mut results: mpsc::Receiver<BatchResult<T>>, mut handle: F) -> Result<()>
where
    F: FnMut(Vec<T>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut upstream = Vec::new();

    while let Some(result) = results.recv().await {
        match result {
            Ok(batch) => handle(batch).await?,
            Err(e) => {
                tracing::debug!("upstream batch error: {e}");
                upstream.push(e);
            }
        }
    }

    match Error::aggregate(upstream) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Pairs the i-th successful batch of `left` with the i-th successful batch
/// of `right`.
///
/// A round in which either side yields an error is skipped after recording
/// the error. Stops as soon as either channel closes.
///
/// # Errors
///
/// Same contract as [`drain`].
pub async fn zip<A, B, F, Fut>(
    mut left: mpsc::Receiver<BatchResult<A>>,
    mut right: mpsc::Receiver<BatchResult<B>>,
    mut combine: F,
) -> Result<()>
where
    F: FnMut(Vec<A>, Vec<B>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut upstream = Vec::new();

    loop {
        let a = match left.recv().await {
            None => break,
            Some(Err(e)) => {
                upstream.push(e);
                continue;
            }
            Some(Ok(a)) => a,
        };
        let b = match right.recv().await {
            None => break,
            Some(Err(e)) => {
                upstream.push(e);
                continue;
            }
            Some(Ok(b)) => b,
        };
        combine(a, b).await?;
    }

    match Error::aggregate(upstream) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn channel_of<T>(items: Vec<BatchResult<T>>) -> mpsc::Receiver<BatchResult<T>> {
        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            tx.send(item).await.unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn drain_continues_past_upstream_errors() {
        let rx = channel_of(vec![
            Ok(vec![1, 2]),
            Err(Error::backend("flaky")),
            Ok(vec![3]),
        ])
        .await;
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let result = drain(rx, move |batch| {
            sink.lock().push(batch);
            async { Ok(()) }
        })
        .await;

        assert_eq!(*seen.lock(), vec![vec![1, 2], vec![3]]);
        assert_eq!(
            result,
            Err(Error::Aggregate(vec![Error::backend("flaky")]))
        );
    }

    #[tokio::test]
    async fn drain_stops_on_handler_failure() {
        let rx = channel_of(vec![Ok(vec![1]), Ok(vec![2])]).await;
        let mut calls = 0;

        let result = drain(rx, |_batch: Vec<i32>| {
            calls += 1;
            async {
                Err(Error::ChannelError {
                    context: "client gone".into(),
                })
            }
        })
        .await;

        assert_eq!(calls, 1);
        assert!(matches!(result, Err(Error::ChannelError { .. })));
    }

    #[tokio::test]
    async fn drain_of_clean_stream_is_ok() {
        let rx = channel_of::<i32>(vec![Ok(vec![]), Ok(vec![1])]).await;
        assert_eq!(drain(rx, |_| async { Ok(()) }).await, Ok(()));
    }

    #[tokio::test]
    async fn zip_pairs_batches_and_skips_failed_rounds() {
        let left = channel_of(vec![Ok(vec![1]), Err(Error::backend("l")), Ok(vec![3])]).await;
        let right = channel_of(vec![Ok(vec!['a']), Ok(vec!['c'])]).await;
        let pairs = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let sink = Arc::clone(&pairs);
        let result = zip(left, right, move |a, b| {
            sink.lock().push((a, b));
            async { Ok(()) }
        })
        .await;

        assert_eq!(
            *pairs.lock(),
            vec![(vec![1], vec!['a']), (vec![3], vec!['c'])]
        );
        assert_eq!(result, Err(Error::Aggregate(vec![Error::backend("l")])));
    }

    #[tokio::test]
    async fn zip_stops_when_either_side_closes() {
        let left = channel_of(vec![Ok(vec![1]), Ok(vec![2])]).await;
        let right = channel_of(vec![Ok(vec![10])]).await;
        let mut rounds = 0;

        let result = zip(left, right, |_: Vec<i32>, _: Vec<i32>| {
            rounds += 1;
            async { Ok(()) }
        })
        .await;

        assert_eq!(rounds, 1);
        assert_eq!(result, Ok(()));
    }
}
