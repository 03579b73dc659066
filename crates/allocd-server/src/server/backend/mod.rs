//! Collaborator interfaces the control plane consumes.
//!
//! - [`TaskStore`] - tasks, experiments, users and interactive task creators.
//! - [`TaskLogBackend`] - filtered, cursor-paged task log storage.
//! - [`TaskKindSource`] - lifecycle states of interactive task kinds.
//!
//! [`memory::MemoryStore`] implements all three.

pub mod memory;

use crate::server::streaming::filter::Filter;
use allocd_core::{
    Result,
    types::{
        Experiment, ExperimentId, LogOrder, Task, TaskId, TaskKind, TaskLog, TaskLogFields,
        TaskState, User, UserId,
    },
};
use bytes::Bytes;
use core::time::Duration;

/// Opaque follow position returned by a [`TaskLogBackend`] and handed back
/// verbatim on the next fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cursor(Bytes);

impl Cursor {
    pub const fn new(raw: Bytes) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[tonic::async_trait]
pub trait TaskStore: Send + Sync + 'static {
    async fn task_by_id(&self, id: &TaskId) -> Result<Option<Task>>;

    async fn experiment_by_id(&self, id: ExperimentId) -> Result<Option<Experiment>>;

    /// The experiment a trial task belongs to; `None` for other tasks.
    async fn experiment_by_task(&self, id: &TaskId) -> Result<Option<Experiment>>;

    /// The user that launched an interactive task, if one was recorded.
    async fn task_creator(&self, id: &TaskId) -> Result<Option<UserId>>;

    async fn user_by_id(&self, id: UserId) -> Result<Option<User>>;
}

#[tonic::async_trait]
pub trait TaskLogBackend: Send + Sync + 'static {
    async fn task_logs_count(&self, task: &TaskId, filters: &[Filter]) -> Result<usize>;

    /// Returns up to `limit` matching records after `cursor`, and the cursor
    /// to resume from.
    async fn task_logs(
        &self,
        task: &TaskId,
        limit: usize,
        filters: &[Filter],
        order: LogOrder,
        cursor: Option<Cursor>,
    ) -> Result<(Vec<TaskLog>, Option<Cursor>)>;

    async fn task_logs_fields(&self, task: &TaskId) -> Result<TaskLogFields>;

    /// How long after a task's end time late records may still arrive.
    fn max_termination_delay(&self) -> Duration;
}

#[tonic::async_trait]
pub trait TaskKindSource: Send + Sync + 'static {
    /// Lifecycle states of every live task of `kind`.
    async fn task_states(&self, kind: TaskKind) -> Result<Vec<TaskState>>;
}
