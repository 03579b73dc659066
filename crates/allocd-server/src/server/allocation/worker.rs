use super::{
    rendezvous::Rendezvous,
    request::{AllocationRequest, AllocationState},
};
use allocd_core::{Error, types::AllocationId};
use tokio::sync::mpsc;

/// Coordination task owning the runtime state of a single allocation.
///
/// Every request for the allocation goes through `rx`, so readiness, the
/// proxy address and the rendezvous rounds are mutated by this task alone.
/// The loop exits on [`AllocationRequest::Shutdown`] or when every sender is
/// dropped; either way pending rendezvous watchers are failed with
/// [`Error::ServiceShutdown`].
pub async fn allocation_loop(id: AllocationId, mut rx: mpsc::Receiver<AllocationRequest>) {
    tracing::trace!("Allocation {id} coordinator started");

    let mut state = AllocationState::default();
    let mut rendezvous = Rendezvous::default();

    while let Some(request) = rx.recv().await {
        match request {
            AllocationRequest::Ready { response } => {
                state.ready = true;
                state.waiting = false;
                let _ = response.send(());
            }
            AllocationRequest::Waiting { response } => {
                state.waiting = true;
                state.ready = false;
                let _ = response.send(());
            }
            AllocationRequest::SetProxyAddress { address, response } => {
                tracing::debug!("Allocation {id} proxy address set to {address}");
                state.proxy_address = Some(address);
                let _ = response.send(());
            }
            AllocationRequest::WatchAllGather {
                round,
                watcher,
                num_peers,
                data,
                response,
            } => {
                let registered = rendezvous.watch(&round, watcher, num_peers, data);
                if response.send(registered).is_err() {
                    // The caller left before registration was acknowledged.
                    rendezvous.unwatch(&round, watcher);
                }
            }
            AllocationRequest::UnwatchAllGather { round, watcher } => {
                rendezvous.unwatch(&round, watcher);
            }
            AllocationRequest::State { response } => {
                let _ = response.send(state.clone());
            }
            AllocationRequest::Shutdown { response } => {
                tracing::debug!("Allocation {id} received shutdown signal");
                rendezvous.fail_all(&Error::ServiceShutdown);

                if response.send(()).is_err() {
                    tracing::error!("Allocation {id} failed to acknowledge shutdown");
                }
                break;
            }
        }
    }

    rendezvous.fail_all(&Error::ServiceShutdown);
    tracing::trace!("Allocation {id} coordinator stopped");
}
