//! Incremental fetch loop behind every batched stream.
//!
//! A [`BatchStreamProcessor`] repeatedly asks a [`BatchFetch`] for the next
//! batch and pushes it into a bounded channel until one of:
//!
//! - the requested limit is satisfied (non-follow),
//! - a fetch returns nothing (non-follow),
//! - the task is terminal and a final drain returned nothing (follow),
//! - a fetch or termination check fails (the error is emitted last),
//! - the cancellation token fires or the consumer goes away.
//!
//! In follow mode the termination check only runs after an empty batch, or on
//! every cycle when [`BatchStreamProcessor::always_check_termination`] is set.
//! Once a task is seen terminal, one more fetch cycle runs so records written
//! between the last fetch and termination are still delivered.

use super::batch::{BatchRequest, BatchResult};
use allocd_core::Result;
use core::{future::Future, time::Duration};
use tokio::{sync::mpsc, time::sleep};
use tokio_util::sync::CancellationToken;

/// Produces the next batch of a stream.
#[tonic::async_trait]
pub trait BatchFetch<T: Send + 'static>: Send {
    /// Fetches up to `req.limit` records. An empty batch means "nothing new
    /// right now".
    async fn fetch(&mut self, req: BatchRequest) -> Result<Vec<T>>;
}

/// Decides whether the producing task has ended.
#[tonic::async_trait]
pub trait TerminationCheck: Send {
    async fn is_terminal(&mut self) -> Result<bool>;
}

/// A termination check for sources that never end on their own.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverTerminal;

#[tonic::async_trait]
impl TerminationCheck for NeverTerminal {
    async fn is_terminal(&mut self) -> Result<bool> {
        Ok(false)
    }
}

/// Adapts an async closure into a [`BatchFetch`].
pub struct FetchFn<F>(F);

pub const fn fetch_fn<F>(f: F) -> FetchFn<F> {
    FetchFn(f)
}

#[tonic::async_trait]
impl<T, F, Fut> BatchFetch<T> for FetchFn<F>
where
    T: Send + 'static,
    F: FnMut(BatchRequest) -> Fut + Send,
    Fut: Future<Output = Result<Vec<T>>> + Send,
{
    async fn fetch(&mut self, req: BatchRequest) -> Result<Vec<T>> {
        (self.0)(req).await
    }
}

/// Adapts an async closure into a [`TerminationCheck`].
pub struct TerminationFn<F>(F);

pub const fn termination_fn<F>(f: F) -> TerminationFn<F> {
    TerminationFn(f)
}

#[tonic::async_trait]
impl<F, Fut> TerminationCheck for TerminationFn<F>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<bool>> + Send,
{
    async fn is_terminal(&mut self) -> Result<bool> {
        (self.0)().await
    }
}

pub struct BatchStreamProcessor<F, C> {
    request: BatchRequest,
    fetcher: F,
    termination: C,
    max_batch_size: i64,
    always_check_termination: bool,
    batch_wait: Option<Duration>,
    miss_wait: Duration,
}

impl<F, C> BatchStreamProcessor<F, C> {
    /// `miss_wait` is how long a following stream sleeps after an empty batch.
    pub const fn new(request: BatchRequest, fetcher: F, termination: C, miss_wait: Duration) -> Self {
        Self {
            request,
            fetcher,
            termination,
            max_batch_size: i64::MAX,
            always_check_termination: false,
            batch_wait: None,
            miss_wait,
        }
    }

    /// Caps the number of records requested per fetch.
    #[must_use]
    pub const fn max_batch_size(mut self, size: i64) -> Self {
        self.max_batch_size = if size < 1 { 1 } else { size };
        self
    }

    /// Sleeps this long between non-empty batches of a following stream.
    #[must_use]
    pub const fn batch_wait(mut self, wait: Duration) -> Self {
        self.batch_wait = Some(wait);
        self
    }

    /// Treats every cycle as a snapshot: check termination after each fetch
    /// and never stop just because the limit is exhausted.
    #[must_use]
    pub const fn always_check_termination(mut self, enabled: bool) -> Self {
        self.always_check_termination = enabled;
        self
    }

    fn next_request(&self) -> BatchRequest {
        let limit = if self.request.follow {
            self.max_batch_size
        } else {
            self.request.limit.min(self.max_batch_size)
        };
        BatchRequest::new(limit, self.request.follow)
    }

    /// Runs the fetch loop to completion, emitting into `tx`.
    ///
    /// The channel is closed (by dropping `tx`) when the loop ends, which is
    /// how consumers learn the stream is complete.
    pub async fn run<T>(mut self, cancel: CancellationToken, tx: mpsc::Sender<BatchResult<T>>)
    where
        T: Send + 'static,
        F: BatchFetch<T>,
        C: TerminationCheck,
    {
        let mut draining = false;

        loop {
            if !self.request.follow && !self.always_check_termination && self.request.limit <= 0 {
                tracing::trace!("requested limit satisfied");
                return;
            }

            let request = self.next_request();
            let fetched = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                res = self.fetcher.fetch(request) => res,
            };

            let batch = match fetched {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::debug!("batch fetch failed: {e}");
                    emit(&cancel, &tx, Err(e)).await;
                    return;
                }
            };

            let size = batch.len();
            if size > 0 {
                if !emit(&cancel, &tx, Ok(batch)).await {
                    return;
                }
                self.request.limit = self
                    .request
                    .limit
                    .saturating_sub(i64::try_from(size).unwrap_or(i64::MAX));
            }

            if draining || !self.request.follow {
                if size == 0 || self.always_check_termination {
                    return;
                }
                continue;
            }

            if size == 0 || self.always_check_termination {
                let terminal = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    res = self.termination.is_terminal() => res,
                };
                match terminal {
                    Ok(true) => {
                        tracing::debug!("source terminated, draining remaining records");
                        draining = true;
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::debug!("termination check failed: {e}");
                        emit(&cancel, &tx, Err(e)).await;
                        return;
                    }
                }
            }

            let wait = if size == 0 {
                Some(self.miss_wait)
            } else {
                self.batch_wait
            };
            if let Some(wait) = wait {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    () = sleep(wait) => {}
                }
            }
        }
    }
}

/// Sends one result downstream; `false` when cancelled or the consumer is
/// gone.
async fn emit<T>(
    cancel: &CancellationToken,
    tx: &mpsc::Sender<BatchResult<T>>,
    result: BatchResult<T>,
) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        sent = tx.send(result) => sent.is_ok(),
    }
}
