//! # Domain Types
//!
//! Identifiers and records exchanged between the coordination layer and its
//! collaborators (task store, log backend, authorization provider).
//!
//! ## Identifiers
//!
//! - [`AllocationId`] - `<task-id>.<n>`; the task id is the prefix before the
//!   first `.`.
//! - [`TaskId`] - Opaque task identifier.
//! - [`ExperimentId`], [`UserId`] - Numeric database identifiers.
//!
//! ## Records
//!
//! - [`Task`], [`Experiment`], [`User`] - Ownership and authorization inputs.
//! - [`TaskLog`], [`TaskLogFields`] - Records served by the log streams.

use core::fmt;
use std::collections::BTreeSet;
use std::time::SystemTime;

pub type ExperimentId = i32;
pub type UserId = i32;

/// Identifies a task.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one scheduling unit of a task.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(String);

impl AllocationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The owning task id: everything before the first `.`.
    pub fn task_id(&self) -> TaskId {
        let (task, _) = self.0.split_once('.').unwrap_or((self.0.as_str(), ""));
        TaskId::from(task)
    }
}

impl From<&str> for AllocationId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for AllocationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Discriminates experiment trials from freestanding tasks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskType {
    Trial,
    Notebook,
    Shell,
    Command,
    Tensorboard,
    CheckpointGc,
}

/// The interactive task kinds counted by `GetActiveTasksCount`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Notebook,
    Tensorboard,
    Command,
    Shell,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::Notebook,
        TaskKind::Tensorboard,
        TaskKind::Command,
        TaskKind::Shell,
    ];
}

/// Lifecycle state reported by a task kind subsystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Pulling,
    Starting,
    Running,
    Terminating,
    Terminated,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub start_time: SystemTime,
    /// Set once when the task completes.
    pub end_time: Option<SystemTime>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Experiment {
    pub id: ExperimentId,
    pub owner_id: UserId,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub admin: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

/// Sort order of log records by id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogOrder {
    #[default]
    Ascending,
    Descending,
}

/// One line of task output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskLog {
    pub id: u64,
    pub task_id: TaskId,
    pub allocation_id: Option<AllocationId>,
    pub agent_id: Option<String>,
    pub container_id: Option<String>,
    pub rank_id: Option<i32>,
    pub timestamp: SystemTime,
    pub level: LogLevel,
    pub log: String,
    pub source: Option<String>,
    pub stdtype: Option<String>,
}

/// Distinct values of every filterable log field of one task.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskLogFields {
    pub allocation_ids: BTreeSet<String>,
    pub agent_ids: BTreeSet<String>,
    pub container_ids: BTreeSet<String>,
    pub rank_ids: BTreeSet<i32>,
    pub stdtypes: BTreeSet<String>,
    pub sources: BTreeSet<String>,
}

impl TaskLogFields {
    pub fn observe(&mut self, log: &TaskLog) {
        if let Some(id) = &log.allocation_id {
            self.allocation_ids.insert(id.to_string());
        }
        if let Some(id) = &log.agent_id {
            self.agent_ids.insert(id.clone());
        }
        if let Some(id) = &log.container_id {
            self.container_ids.insert(id.clone());
        }
        if let Some(rank) = log.rank_id {
            self.rank_ids.insert(rank);
        }
        if let Some(stdtype) = &log.stdtype {
            self.stdtypes.insert(stdtype.clone());
        }
        if let Some(source) = &log.source {
            self.sources.insert(source.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_id_derives_task_prefix() {
        assert_eq!(AllocationId::from("abc.0").task_id(), TaskId::from("abc"));
        assert_eq!(AllocationId::from("abc.0.1").task_id(), TaskId::from("abc"));
        assert_eq!(AllocationId::from("abc").task_id(), TaskId::from("abc"));
    }

    #[test]
    fn fields_collect_distinct_values() {
        let mut fields = TaskLogFields::default();
        for rank in [1, 0, 1] {
            fields.observe(&TaskLog {
                id: 0,
                task_id: TaskId::from("t"),
                allocation_id: Some(AllocationId::from("t.0")),
                agent_id: None,
                container_id: None,
                rank_id: Some(rank),
                timestamp: SystemTime::UNIX_EPOCH,
                level: LogLevel::Info,
                log: String::new(),
                source: Some("master".into()),
                stdtype: None,
            });
        }
        assert_eq!(fields.rank_ids.into_iter().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(fields.allocation_ids.len(), 1);
        assert!(fields.stdtypes.is_empty());
    }
}
