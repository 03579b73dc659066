//! Registry of live allocations.
//!
//! Every registered allocation gets its own coordination task (see
//! [`allocation_loop`]) reached through a bounded queue. The registry maps
//! allocation ids to those queues together with the ownership facts the
//! authorization gateway needs.

use super::{handle::AllocationHandle, worker::allocation_loop};
use allocd_core::{
    Error, Result,
    types::{AllocationId, ExperimentId, TaskId},
};
use core::time::Duration;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tokio::{sync::mpsc, time::timeout};

/// What the registry knows about one allocation.
#[derive(Clone, Debug)]
pub struct AllocationEntry {
    pub task_id: TaskId,
    /// Set for trial allocations; `None` for interactive tasks.
    pub experiment_id: Option<ExperimentId>,
    pub handle: AllocationHandle,
}

#[derive(Clone)]
pub struct AllocationRegistry {
    entries: Arc<RwLock<HashMap<AllocationId, AllocationEntry>>>,
    queue_size: usize,
    shutdown_timeout: Duration,
}

impl AllocationRegistry {
    pub fn new(queue_size: usize, shutdown_timeout: Duration) -> Self {
        Self {
            entries: Arc::default(),
            queue_size: queue_size.max(1),
            shutdown_timeout,
        }
    }

    /// Starts the coordination task of a new allocation.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] if `id` is already registered.
    pub fn register(
        &self,
        id: AllocationId,
        task_id: TaskId,
        experiment_id: Option<ExperimentId>,
    ) -> Result<AllocationHandle> {
        let mut entries = self.entries.write();
        if entries.contains_key(&id) {
            return Err(Error::invalid(format!(
                "allocation {id} is already registered"
            )));
        }

        let (tx, rx) = mpsc::channel(self.queue_size);
        tokio::spawn(allocation_loop(id.clone(), rx));

        let handle = AllocationHandle::new(id.clone(), tx);
        tracing::debug!("Registered allocation {id} of task {task_id}");
        entries.insert(
            id,
            AllocationEntry {
                task_id,
                experiment_id,
                handle: handle.clone(),
            },
        );
        Ok(handle)
    }

    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown allocation.
    pub fn get(&self, id: &AllocationId) -> Result<AllocationEntry> {
        self.entries
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("allocation", id))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Unregisters an allocation and stops its coordination task, failing
    /// any rendezvous round still pending.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown allocation.
    pub async fn remove(&self, id: &AllocationId) -> Result<()> {
        let entry = self
            .entries
            .write()
            .remove(id)
            .ok_or_else(|| Error::not_found("allocation", id))?;
        stop(&entry.handle, self.shutdown_timeout).await;
        Ok(())
    }

    /// Stops every coordination task, waiting up to the shutdown timeout for
    /// each acknowledgement.
    pub async fn shutdown(&self) {
        let entries: Vec<AllocationEntry> = self.entries.write().drain().map(|(_, e)| e).collect();
        tracing::debug!("Notifying {} allocations to shut down", entries.len());

        let shutdown_timeout = self.shutdown_timeout;
        let stops = entries
            .iter()
            .map(|entry| stop(&entry.handle, shutdown_timeout));
        futures::future::join_all(stops).await;

        tracing::info!("Allocation registry shutdown complete");
    }
}

async fn stop(handle: &AllocationHandle, shutdown_timeout: Duration) {
    match timeout(shutdown_timeout, handle.shutdown()).await {
        Ok(Ok(())) => {
            tracing::trace!("Allocation {} shutdown acknowledged", handle.id());
        }
        Ok(Err(e)) => {
            tracing::error!("Allocation {} returned error: {e}", handle.id());
        }
        Err(_) => {
            tracing::warn!("Allocation {} shutdown timed out", handle.id());
        }
    }
}
