//! All-gather rendezvous rounds of one allocation.
//!
//! A round is keyed by its name and sized by the first watcher's `num_peers`.
//! It seals when the watcher count reaches that size: every watcher receives
//! the same payload list, ordered by registration, and the round is removed.
//! A failed or abandoned round is also removed, so reusing its name starts a
//! fresh round.
//!
//! [`Rendezvous`] is plain state owned by the allocation coordination task;
//! all mutation is serialized through that task's queue.

use crate::server::telemetry::{increment_rounds_failed, increment_rounds_sealed};
use allocd_core::{Error, Result};
use bytes::Bytes;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Payloads of every watcher of a sealed round, in registration order.
pub type AllGatherData = Arc<[Bytes]>;

pub type AllGatherResult = Result<AllGatherData>;

struct Watcher {
    id: Uuid,
    data: Bytes,
    tx: oneshot::Sender<AllGatherResult>,
}

struct Round {
    num_peers: usize,
    watchers: Vec<Watcher>,
}

impl Round {
    fn seal(self) {
        let data: AllGatherData = self.watchers.iter().map(|w| w.data.clone()).collect();
        for watcher in self.watchers {
            // A watcher that already went away has nothing to deliver to.
            let _ = watcher.tx.send(Ok(Arc::clone(&data)));
        }
        increment_rounds_sealed();
    }

    fn fail(self, err: &Error) {
        for watcher in self.watchers {
            let _ = watcher.tx.send(Err(err.clone()));
        }
        increment_rounds_failed();
    }
}

#[derive(Default)]
pub struct Rendezvous {
    rounds: HashMap<String, Round>,
}

impl Rendezvous {
    /// Registers `watcher` in `round` and returns the channel its result is
    /// delivered on.
    ///
    /// Invalid peer counts fail the whole round: every existing watcher and
    /// the caller receive the error and the round is discarded.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] if `watcher` is already registered in the
    /// round. This only affects the caller.
    pub fn watch(
        &mut self,
        round: &str,
        watcher: Uuid,
        num_peers: i32,
        data: Bytes,
    ) -> Result<oneshot::Receiver<AllGatherResult>> {
        let (tx, rx) = oneshot::channel();

        let Some(num_peers) = usize::try_from(num_peers).ok().filter(|&n| n >= 1) else {
            let err = Error::invalid(format!(
                "round '{round}': number of peers must be at least 1, got {num_peers}"
            ));
            self.fail_round(round, &err);
            let _ = tx.send(Err(err));
            return Ok(rx);
        };

        if let Some(existing) = self.rounds.get(round) {
            if existing.watchers.iter().any(|w| w.id == watcher) {
                return Err(Error::invalid(format!(
                    "watcher {watcher} is already registered in round '{round}'"
                )));
            }
            if existing.num_peers != num_peers {
                let err = Error::invalid(format!(
                    "round '{round}': expected {} peers, got {num_peers}",
                    existing.num_peers
                ));
                self.fail_round(round, &err);
                let _ = tx.send(Err(err));
                return Ok(rx);
            }
        }

        let state = self
            .rounds
            .entry(round.to_owned())
            .or_insert_with(|| Round {
                num_peers,
                watchers: Vec::with_capacity(num_peers),
            });
        state.watchers.push(Watcher { id: watcher, data, tx });
        tracing::trace!(
            "round '{round}': {}/{} watchers",
            state.watchers.len(),
            state.num_peers
        );

        if state.watchers.len() == state.num_peers {
            if let Some(sealed) = self.rounds.remove(round) {
                tracing::debug!("round '{round}' sealed");
                sealed.seal();
            }
        }

        Ok(rx)
    }

    /// Deregisters `watcher` from `round` before it sealed.
    ///
    /// The round can no longer reach its peer count, so the remaining
    /// watchers are failed with [`Error::RoundAbandoned`] and the round is
    /// discarded. Returns `false` (and does nothing) when the watcher is not
    /// pending in that round, e.g. because the round already sealed.
    pub fn unwatch(&mut self, round: &str, watcher: Uuid) -> bool {
        let pending = self
            .rounds
            .get(round)
            .is_some_and(|r| r.watchers.iter().any(|w| w.id == watcher));
        if !pending {
            return false;
        }

        if let Some(mut state) = self.rounds.remove(round) {
            state.watchers.retain(|w| w.id != watcher);
            tracing::debug!("round '{round}' abandoned by {watcher}");
            state.fail(&Error::RoundAbandoned {
                round: round.to_owned(),
                watcher: watcher.to_string(),
            });
        }
        true
    }

    /// Fails every pending round with `err`.
    pub fn fail_all(&mut self, err: &Error) {
        for (_, round) in self.rounds.drain() {
            round.fail(err);
        }
    }

    pub fn pending_rounds(&self) -> usize {
        self.rounds.len()
    }

    fn fail_round(&mut self, round: &str, err: &Error) {
        if let Some(state) = self.rounds.remove(round) {
            state.fail(err);
        }
    }
}
