use super::rendezvous::AllGatherResult;
use allocd_core::Result;
use bytes::Bytes;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Observable runtime state of an allocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocationState {
    pub ready: bool,
    pub waiting: bool,
    pub proxy_address: Option<String>,
}

/// Messages processed by an allocation coordination task.
///
/// Requests carrying a `response` sender are acknowledged once applied.
#[derive(Debug)]
pub enum AllocationRequest {
    Ready {
        response: oneshot::Sender<()>,
    },
    Waiting {
        response: oneshot::Sender<()>,
    },
    SetProxyAddress {
        address: String,
        response: oneshot::Sender<()>,
    },
    WatchAllGather {
        round: String,
        watcher: Uuid,
        num_peers: i32,
        data: Bytes,
        response: oneshot::Sender<Result<oneshot::Receiver<AllGatherResult>>>,
    },
    /// Fire-and-forget; sent when a watcher gives up before its round seals.
    UnwatchAllGather {
        round: String,
        watcher: Uuid,
    },
    State {
        response: oneshot::Sender<AllocationState>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}
