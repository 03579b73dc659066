use super::{
    aggregator::drain,
    batch::BatchResult,
    processor::{BatchFetch, BatchStreamProcessor, TerminationCheck},
};
use crate::server::telemetry::{
    decrement_streams_inflight, increment_records_streamed, increment_stream_errors,
    increment_streams_inflight, record_stream_duration,
};
use allocd_core::Error;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::Instrument;

/// Runs `processor` in the background and returns the receiving end of the
/// gRPC response stream it feeds.
///
/// Two tasks cooperate through a bounded channel of `buffer_size` batches: the
/// processor fetches, and the forwarder converts each record with `convert`
/// and sends it to the client. Both observe `cancel`.
pub fn stream_batches<T, R, F, C, M>(
    processor: BatchStreamProcessor<F, C>,
    cancel: CancellationToken,
    buffer_size: usize,
    convert: M,
) -> mpsc::Receiver<Result<R, Status>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: BatchFetch<T> + 'static,
    C: TerminationCheck + 'static,
    M: Fn(T) -> R + Send + Sync + 'static,
{
    let (batch_tx, batch_rx) = mpsc::channel(buffer_size);
    let (resp_tx, resp_rx) = mpsc::channel(buffer_size);

    tokio::spawn(
        processor
            .run(cancel.clone(), batch_tx)
            .instrument(tracing::debug_span!("fetching")),
    );

    let forward = async move {
        let start = Instant::now();
        increment_streams_inflight();

        match feed_batches(batch_rx, resp_tx, cancel, convert).await {
            Ok(()) => {
                tracing::debug!("Stream completed");
            }
            Err(e) => {
                increment_stream_errors();
                tracing::warn!("Stream ended with error: {e}");
            }
        }

        decrement_streams_inflight();
        record_stream_duration(start.elapsed().as_secs_f64() * 1000.0);
    };
    tokio::spawn(forward.instrument(tracing::info_span!("streaming")));

    resp_rx
}

/// Forwards every record of `batches` to the client.
///
/// A failed send to the client, or the client hanging up while the stream is
/// idle, is fatal: `cancel` is fired so the producer stops, and the error is
/// returned. Upstream errors collected while draining are surfaced to the
/// client as the stream's final item.
///
/// # Errors
///
/// The delivery failure, or the aggregated upstream errors.
pub async fn feed_batches<T, R, M>(
    batches: mpsc::Receiver<BatchResult<T>>,
    resp_tx: mpsc::Sender<Result<R, Status>>,
    cancel: CancellationToken,
    convert: M,
) -> allocd_core::Result<()>
where
    M: Fn(T) -> R,
{
    let forward = drain(batches, |batch| {
        let resp_tx = resp_tx.clone();
        let records: Vec<R> = batch.into_iter().map(&convert).collect();
        async move {
            let count = records.len() as u64;
            for record in records {
                // If the client went away there is nobody left to report to.
                if let Err(e) = resp_tx.send(Ok(record)).await {
                    return Err(Error::ChannelError {
                        context: format!("Failed to forward record: {e}"),
                    });
                }
            }
            increment_records_streamed(count);
            Ok(())
        }
    });

    // An idle stream sends nothing, so a departed client is only noticed by
    // watching the channel itself.
    let result = tokio::select! {
        res = forward => res,
        () = resp_tx.closed() => Err(Error::ChannelError {
            context: "Client disconnected".to_string(),
        }),
    };

    // The producer is either finished already or must stop now.
    cancel.cancel();

    if let Err(e) = &result {
        if !matches!(e, Error::ChannelError { .. }) {
            // Best effort: the client may have disconnected as well.
            if let Err(_e) = resp_tx.send(Err(e.clone().into())).await {
                tracing::warn!("Failed to forward err: {_e}");
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::streaming::{
        batch::BatchRequest,
        processor::{NeverTerminal, fetch_fn},
    };
    use core::time::Duration;
    use futures::future::ready;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };
    use tonic::Code;

    #[tokio::test]
    async fn forwards_records_and_reports_upstream_errors_last() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(vec![1, 2])).await.unwrap();
        tx.send(Err(Error::backend("hiccup"))).await.unwrap();
        tx.send(Ok(vec![3])).await.unwrap();
        drop(tx);

        let (resp_tx, mut resp_rx) = mpsc::channel(8);
        let result = feed_batches(rx, resp_tx, CancellationToken::new(), |n: i32| n * 10).await;
        assert!(matches!(result, Err(Error::Aggregate(_))));

        let mut records = Vec::new();
        let mut status = None;
        while let Some(item) = resp_rx.recv().await {
            match item {
                Ok(n) => records.push(n),
                Err(s) => status = Some(s),
            }
        }
        assert_eq!(records, vec![10, 20, 30]);
        assert_eq!(status.map(|s| s.code()), Some(Code::Internal));
    }

    #[tokio::test]
    async fn client_disconnect_cancels_the_producer() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(vec![1])).await.unwrap();
        let (resp_tx, resp_rx) = mpsc::channel::<Result<i32, Status>>(1);
        drop(resp_rx);
        let cancel = CancellationToken::new();

        let result = feed_batches(rx, resp_tx, cancel.clone(), |n: i32| n).await;
        assert!(matches!(result, Err(Error::ChannelError { .. })));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn end_to_end_stream_closes_after_limit() {
        let mut remaining: Vec<u32> = (0..7).collect();
        let fetcher = fetch_fn(move |req: BatchRequest| {
            let take = usize::try_from(req.limit).unwrap_or(0).min(remaining.len());
            let batch: Vec<u32> = remaining.drain(..take).collect();
            async move { Ok(batch) }
        });
        let processor = BatchStreamProcessor::new(
            BatchRequest::new(5, false),
            fetcher,
            NeverTerminal,
            Duration::from_millis(10),
        )
        .max_batch_size(2);

        let mut rx = stream_batches(processor, CancellationToken::new(), 2, |n: u32| n.to_string());
        let mut out = Vec::new();
        while let Some(item) = rx.recv().await {
            out.push(item.unwrap());
        }
        assert_eq!(out, vec!["0", "1", "2", "3", "4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_follow_stream_stops_once_the_client_hangs_up() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fetches);
        let fetcher = fetch_fn(move |_req: BatchRequest| {
            counter.fetch_add(1, Ordering::Relaxed);
            ready(Ok(Vec::<u32>::new()))
        });
        let processor = BatchStreamProcessor::new(
            BatchRequest::new(0, true),
            fetcher,
            NeverTerminal,
            Duration::from_secs(1),
        );

        let cancel = CancellationToken::new();
        let rx = stream_batches(processor, cancel.clone(), 2, |n: u32| n);
        drop(rx);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(cancel.is_cancelled());

        let seen = fetches.load(Ordering::Relaxed);
        assert!(seen <= 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fetches.load(Ordering::Relaxed), seen);
    }
}
