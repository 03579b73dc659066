use super::{
    rendezvous::AllGatherData,
    rendezvous::AllGatherResult,
    request::{AllocationRequest, AllocationState},
};
use allocd_core::{Error, Result, types::AllocationId};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Cheap, cloneable address of an allocation coordination task.
#[derive(Clone, Debug)]
pub struct AllocationHandle {
    id: AllocationId,
    tx: mpsc::Sender<AllocationRequest>,
}

impl AllocationHandle {
    pub(crate) const fn new(id: AllocationId, tx: mpsc::Sender<AllocationRequest>) -> Self {
        Self { id, tx }
    }

    pub const fn id(&self) -> &AllocationId {
        &self.id
    }

    fn stopped(&self) -> Error {
        Error::ChannelError {
            context: format!("Allocation {} coordinator stopped", self.id),
        }
    }

    async fn ask<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> AllocationRequest) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).await.map_err(|_| self.stopped())?;
        rx.await.map_err(|_| self.stopped())
    }

    pub async fn mark_ready(&self) -> Result<()> {
        self.ask(|response| AllocationRequest::Ready { response })
            .await
    }

    pub async fn mark_waiting(&self) -> Result<()> {
        self.ask(|response| AllocationRequest::Waiting { response })
            .await
    }

    pub async fn set_proxy_address(&self, address: String) -> Result<()> {
        self.ask(|response| AllocationRequest::SetProxyAddress { address, response })
            .await
    }

    pub async fn state(&self) -> Result<AllocationState> {
        self.ask(|response| AllocationRequest::State { response })
            .await
    }

    /// Registers a rendezvous watcher.
    ///
    /// The returned [`AllGatherWatch`] resolves once the round seals or
    /// fails. Dropping it unresolved deregisters the watcher, which abandons
    /// the round for its other peers.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] for a duplicate watcher, or
    /// [`Error::ChannelError`] if the coordination task is gone.
    pub async fn watch_all_gather(
        &self,
        round: String,
        watcher: Uuid,
        num_peers: i32,
        data: Bytes,
    ) -> Result<AllGatherWatch> {
        // Armed before the request is queued: a caller cancelled anywhere
        // past this point still deregisters.
        let mut registration = Registration {
            handle: self.clone(),
            round: round.clone(),
            watcher,
            armed: true,
        };

        let registered = self
            .ask(|response| AllocationRequest::WatchAllGather {
                round,
                watcher,
                num_peers,
                data,
                response,
            })
            .await;

        match registered {
            Ok(Ok(rx)) => Ok(AllGatherWatch { registration, rx }),
            Ok(Err(e)) | Err(e) => {
                // Never registered; the id may belong to another watcher.
                registration.disarm();
                Err(e)
            }
        }
    }

    /// Deregisters a watcher without waiting for the coordination task.
    pub fn unwatch_all_gather(&self, round: String, watcher: Uuid) {
        let request = AllocationRequest::UnwatchAllGather { round, watcher };
        match self.tx.try_send(request) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(request)) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let tx = self.tx.clone();
                    runtime.spawn(async move {
                        let _ = tx.send(request).await;
                    });
                }
            }
        }
    }

    pub(crate) async fn shutdown(&self) -> Result<()> {
        self.ask(|response| AllocationRequest::Shutdown { response })
            .await
    }
}

/// Deregisters a watcher on drop unless disarmed.
struct Registration {
    handle: AllocationHandle,
    round: String,
    watcher: Uuid,
    armed: bool,
}

impl Registration {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(
                "Watcher {} left round '{}' before it sealed",
                self.watcher,
                self.round
            );
            self.handle
                .unwatch_all_gather(core::mem::take(&mut self.round), self.watcher);
        }
    }
}

/// A pending rendezvous registration.
#[must_use = "dropping the watch abandons the round"]
pub struct AllGatherWatch {
    registration: Registration,
    rx: oneshot::Receiver<AllGatherResult>,
}

impl AllGatherWatch {
    pub const fn watcher(&self) -> Uuid {
        self.registration.watcher
    }

    /// Waits for the round to seal.
    ///
    /// # Errors
    ///
    /// The error the round failed with, or [`Error::ChannelError`] if the
    /// coordination task dropped the round.
    pub async fn result(mut self) -> Result<AllGatherData> {
        let outcome = (&mut self.rx).await;
        self.registration.disarm();
        outcome.map_err(|_| Error::ChannelError {
            context: format!(
                "Rendezvous round '{}' was dropped",
                self.registration.round
            ),
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::allocation::worker::allocation_loop;
    use core::time::Duration;
    use futures::FutureExt;

    fn spawn_allocation(id: &str) -> AllocationHandle {
        let (tx, rx) = mpsc::channel(8);
        let id = AllocationId::from(id);
        tokio::spawn(allocation_loop(id.clone(), rx));
        AllocationHandle::new(id, tx)
    }

    #[tokio::test]
    async fn tracks_readiness_and_proxy_address() {
        let handle = spawn_allocation("t.0");
        assert_eq!(handle.state().await.unwrap(), AllocationState::default());

        handle.mark_waiting().await.unwrap();
        assert!(handle.state().await.unwrap().waiting);

        handle.mark_ready().await.unwrap();
        handle
            .set_proxy_address("10.0.0.7:8080".into())
            .await
            .unwrap();
        let state = handle.state().await.unwrap();
        assert!(state.ready);
        assert!(!state.waiting);
        assert_eq!(state.proxy_address.as_deref(), Some("10.0.0.7:8080"));
    }

    #[tokio::test]
    async fn concurrent_watchers_receive_the_same_payloads() {
        let handle = spawn_allocation("t.0");
        let mut joins = Vec::new();
        for i in 0..4_u8 {
            let handle = handle.clone();
            joins.push(tokio::spawn(async move {
                let watch = handle
                    .watch_all_gather("r".into(), Uuid::new_v4(), 4, Bytes::from(vec![i]))
                    .await?;
                watch.result().await
            }));
        }

        let mut results = Vec::new();
        for join in joins {
            results.push(join.await.unwrap().unwrap());
        }
        let mut payloads: Vec<u8> = results[0].iter().map(|b| b[0]).collect();
        payloads.sort_unstable();
        assert_eq!(payloads, vec![0, 1, 2, 3]);
        assert!(results.iter().all(|r| *r == results[0]));
    }

    #[tokio::test]
    async fn dropping_a_watch_abandons_the_round() {
        let handle = spawn_allocation("t.0");
        let stays = handle
            .watch_all_gather("r".into(), Uuid::new_v4(), 3, Bytes::new())
            .await
            .unwrap();
        let leaves = handle
            .watch_all_gather("r".into(), Uuid::new_v4(), 3, Bytes::new())
            .await
            .unwrap();

        drop(leaves);
        let outcome = tokio::time::timeout(Duration::from_secs(1), stays.result())
            .await
            .unwrap();
        assert!(matches!(outcome, Err(Error::RoundAbandoned { .. })));
    }

    #[tokio::test]
    async fn shutdown_fails_pending_watchers() {
        let handle = spawn_allocation("t.0");
        let watch = handle
            .watch_all_gather("r".into(), Uuid::new_v4(), 2, Bytes::new())
            .await
            .unwrap();

        handle.shutdown().await.unwrap();
        assert_eq!(watch.result().await, Err(Error::ServiceShutdown));
        assert!(matches!(
            handle.mark_ready().await,
            Err(Error::ChannelError { .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_registration_leaves_no_member_behind() {
        let handle = spawn_allocation("t.0");

        let mut gone = Box::pin(handle.watch_all_gather(
            "r".into(),
            Uuid::new_v4(),
            2,
            Bytes::from_static(b"gone"),
        ));
        // Queue the registration, let the coordinator acknowledge it, then
        // give up before the acknowledgement is read.
        assert!((&mut gone).now_or_never().is_none());
        tokio::task::yield_now().await;
        drop(gone);

        let peers = [&b"x"[..], &b"y"[..]].map(|data| {
            let handle = handle.clone();
            tokio::spawn(async move {
                let watch = handle
                    .watch_all_gather("r".into(), Uuid::new_v4(), 2, Bytes::from_static(data))
                    .await?;
                watch.result().await
            })
        });

        for peer in peers {
            let data = tokio::time::timeout(Duration::from_secs(1), peer)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let mut payloads: Vec<&[u8]> = data.iter().map(|b| b.as_ref()).collect();
            payloads.sort_unstable();
            assert_eq!(payloads, vec![&b"x"[..], &b"y"[..]]);
        }
    }

    #[tokio::test]
    async fn rejected_duplicate_keeps_the_original_registered() {
        let handle = spawn_allocation("t.0");
        let id = Uuid::new_v4();
        let first = handle
            .watch_all_gather("r".into(), id, 2, Bytes::from_static(b"a"))
            .await
            .unwrap();

        let duplicate = handle
            .watch_all_gather("r".into(), id, 2, Bytes::from_static(b"a"))
            .await;
        assert!(matches!(duplicate, Err(Error::InvalidRequest { .. })));

        let second = handle
            .watch_all_gather("r".into(), Uuid::new_v4(), 2, Bytes::from_static(b"b"))
            .await
            .unwrap();
        let data = first.result().await.unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(second.result().await.unwrap(), data);
    }
}
