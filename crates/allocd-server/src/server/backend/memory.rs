//! In-process implementation of every backend trait.
//!
//! Records live behind a single `parking_lot::RwLock`. Log ids are assigned
//! on append and increase monotonically, so the follow cursor is simply the
//! last id served.

use super::{Cursor, TaskKindSource, TaskLogBackend, TaskStore};
use crate::server::streaming::filter::{Filter, FilterOp, FilterValues, LogField};
use allocd_core::{
    Error, Result,
    types::{
        Experiment, ExperimentId, LogOrder, Task, TaskId, TaskKind, TaskLog, TaskLogFields,
        TaskState, User, UserId,
    },
};
use bytes::Bytes;
use core::time::Duration;
use parking_lot::RwLock;
use std::{collections::HashMap, time::SystemTime};

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, User>,
    experiments: HashMap<ExperimentId, Experiment>,
    tasks: HashMap<TaskId, Task>,
    trials: HashMap<TaskId, ExperimentId>,
    creators: HashMap<TaskId, UserId>,
    interactive: HashMap<TaskId, (TaskKind, TaskState)>,
    logs: Vec<TaskLog>,
    next_log_id: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    max_termination_delay: Duration,
}

impl MemoryStore {
    pub fn new(max_termination_delay: Duration) -> Self {
        Self {
            inner: RwLock::default(),
            max_termination_delay,
        }
    }

    pub fn insert_user(&self, user: User) {
        self.inner.write().users.insert(user.id, user);
    }

    pub fn insert_experiment(&self, experiment: Experiment) {
        self.inner.write().experiments.insert(experiment.id, experiment);
    }

    pub fn insert_task(&self, task: Task) {
        self.inner.write().tasks.insert(task.id.clone(), task);
    }

    /// Inserts a trial task owned by `experiment`.
    pub fn insert_trial(&self, task: Task, experiment: ExperimentId) {
        let mut inner = self.inner.write();
        inner.trials.insert(task.id.clone(), experiment);
        inner.tasks.insert(task.id.clone(), task);
    }

    pub fn set_task_creator(&self, task: &TaskId, user: UserId) {
        self.inner.write().creators.insert(task.clone(), user);
    }

    /// Records the end time of a task. The first recorded end time wins;
    /// returns `false` if the task was already ended.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown task.
    pub fn end_task(&self, task: &TaskId, at: SystemTime) -> Result<bool> {
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(task)
            .ok_or_else(|| Error::not_found("task", task))?;
        if task.end_time.is_some() {
            return Ok(false);
        }
        task.end_time = Some(at);
        Ok(true)
    }

    pub fn set_task_state(&self, task: &TaskId, kind: TaskKind, state: TaskState) {
        self.inner
            .write()
            .interactive
            .insert(task.clone(), (kind, state));
    }

    /// Appends a log record, assigning it the next id.
    pub fn append_log(&self, mut log: TaskLog) -> u64 {
        let mut inner = self.inner.write();
        inner.next_log_id += 1;
        log.id = inner.next_log_id;
        inner.logs.push(log);
        inner.next_log_id
    }

    fn matching<'a>(
        logs: &'a [TaskLog],
        task: &'a TaskId,
        filters: &'a [Filter],
    ) -> impl Iterator<Item = Result<&'a TaskLog>> + 'a {
        logs.iter().filter(move |log| &log.task_id == task).filter_map(move |log| {
            for filter in filters {
                match matches(log, filter) {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(e) => return Some(Err(e)),
                }
            }
            Some(Ok(log))
        })
    }
}

fn decode_cursor(cursor: Option<&Cursor>) -> Result<Option<u64>> {
    cursor
        .map(|c| {
            let raw: [u8; 8] = c
                .as_bytes()
                .try_into()
                .map_err(|_| Error::invalid("malformed log cursor"))?;
            Ok(u64::from_be_bytes(raw))
        })
        .transpose()
}

fn matches(log: &TaskLog, filter: &Filter) -> Result<bool> {
    let optional_str = |value: Option<&str>, wanted: &[String]| {
        value.is_some_and(|v| wanted.iter().any(|w| w == v))
    };

    let matched = match (filter.field, filter.op, &filter.values) {
        (LogField::AllocationId, FilterOp::In, FilterValues::Strings(wanted)) => optional_str(
            log.allocation_id.as_ref().map(|id| id.as_str()),
            wanted,
        ),
        (LogField::AgentId, FilterOp::In, FilterValues::Strings(wanted)) => {
            optional_str(log.agent_id.as_deref(), wanted)
        }
        (LogField::ContainerId, FilterOp::In, FilterValues::Strings(wanted)) => {
            optional_str(log.container_id.as_deref(), wanted)
        }
        (LogField::Stdtype, FilterOp::In, FilterValues::Strings(wanted)) => {
            optional_str(log.stdtype.as_deref(), wanted)
        }
        (LogField::Source, FilterOp::In, FilterValues::Strings(wanted)) => {
            optional_str(log.source.as_deref(), wanted)
        }
        (LogField::RankId, FilterOp::In, FilterValues::Integers(wanted)) => {
            log.rank_id.is_some_and(|rank| wanted.contains(&rank))
        }
        (LogField::Level, FilterOp::In, FilterValues::Levels(wanted)) => wanted.contains(&log.level),
        (LogField::Timestamp, FilterOp::LessThanEqual, FilterValues::Time(bound)) => {
            log.timestamp <= *bound
        }
        (LogField::Timestamp, FilterOp::GreaterThan, FilterValues::Time(bound)) => {
            log.timestamp > *bound
        }
        (LogField::Log, FilterOp::Substring, FilterValues::Text(needle)) => log.log.contains(needle),
        (field, op, _) => {
            return Err(Error::invalid(format!(
                "unsupported filter {op:?} on {}",
                field.as_str()
            )));
        }
    };
    Ok(matched)
}

#[tonic::async_trait]
impl TaskStore for MemoryStore {
    async fn task_by_id(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.inner.read().tasks.get(id).cloned())
    }

    async fn experiment_by_id(&self, id: ExperimentId) -> Result<Option<Experiment>> {
        Ok(self.inner.read().experiments.get(&id).cloned())
    }

    async fn experiment_by_task(&self, id: &TaskId) -> Result<Option<Experiment>> {
        let inner = self.inner.read();
        Ok(inner
            .trials
            .get(id)
            .and_then(|exp| inner.experiments.get(exp))
            .cloned())
    }

    async fn task_creator(&self, id: &TaskId) -> Result<Option<UserId>> {
        Ok(self.inner.read().creators.get(id).copied())
    }

    async fn user_by_id(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.inner.read().users.get(&id).cloned())
    }
}

#[tonic::async_trait]
impl TaskLogBackend for MemoryStore {
    async fn task_logs_count(&self, task: &TaskId, filters: &[Filter]) -> Result<usize> {
        let inner = self.inner.read();
        Self::matching(&inner.logs, task, filters).try_fold(0, |count, log| log.map(|_| count + 1))
    }

    async fn task_logs(
        &self,
        task: &TaskId,
        limit: usize,
        filters: &[Filter],
        order: LogOrder,
        cursor: Option<Cursor>,
    ) -> Result<(Vec<TaskLog>, Option<Cursor>)> {
        let after = decode_cursor(cursor.as_ref())?;
        let inner = self.inner.read();

        let mut logs = Self::matching(&inner.logs, task, filters)
            .filter(|log| match (log, after) {
                (Ok(log), Some(after)) => match order {
                    LogOrder::Ascending => log.id > after,
                    LogOrder::Descending => log.id < after,
                },
                _ => true,
            })
            .map(|log| log.cloned())
            .collect::<Result<Vec<_>>>()?;

        if order == LogOrder::Descending {
            logs.reverse();
        }
        logs.truncate(limit);

        let next = logs
            .last()
            .map(|log| Cursor::new(Bytes::copy_from_slice(&log.id.to_be_bytes())))
            .or(cursor);
        Ok((logs, next))
    }

    async fn task_logs_fields(&self, task: &TaskId) -> Result<TaskLogFields> {
        let inner = self.inner.read();
        let mut fields = TaskLogFields::default();
        for log in inner.logs.iter().filter(|log| &log.task_id == task) {
            fields.observe(log);
        }
        Ok(fields)
    }

    fn max_termination_delay(&self) -> Duration {
        self.max_termination_delay
    }
}

#[tonic::async_trait]
impl TaskKindSource for MemoryStore {
    async fn task_states(&self, kind: TaskKind) -> Result<Vec<TaskState>> {
        Ok(self
            .inner
            .read()
            .interactive
            .values()
            .filter(|(k, _)| *k == kind)
            .map(|(_, state)| *state)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use allocd_core::types::{AllocationId, LogLevel};

    fn log_line(task: &str, rank: i32, level: LogLevel, text: &str) -> TaskLog {
        TaskLog {
            id: 0,
            task_id: TaskId::from(task),
            allocation_id: Some(AllocationId::from(format!("{task}.0"))),
            agent_id: Some("agent-1".into()),
            container_id: None,
            rank_id: Some(rank),
            timestamp: SystemTime::UNIX_EPOCH + Duration::from_secs(u64::try_from(rank).unwrap()),
            level,
            log: text.into(),
            source: Some("task".into()),
            stdtype: Some("stdout".into()),
        }
    }

    fn store_with_logs() -> MemoryStore {
        let store = MemoryStore::default();
        for rank in 0..4 {
            store.append_log(log_line("t", rank, LogLevel::Info, "step"));
        }
        store.append_log(log_line("t", 9, LogLevel::Error, "out of memory"));
        store.append_log(log_line("other", 0, LogLevel::Info, "noise"));
        store
    }

    #[tokio::test]
    async fn counts_only_matching_records_of_the_task() {
        let store = store_with_logs();
        let task = TaskId::from("t");
        assert_eq!(store.task_logs_count(&task, &[]).await.unwrap(), 5);

        let errors = [Filter {
            field: LogField::Level,
            op: FilterOp::In,
            values: FilterValues::Levels(vec![LogLevel::Error]),
        }];
        assert_eq!(store.task_logs_count(&task, &errors).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cursor_resumes_after_last_served_record() {
        let store = store_with_logs();
        let task = TaskId::from("t");

        let (first, cursor) = store
            .task_logs(&task, 2, &[], LogOrder::Ascending, None)
            .await
            .unwrap();
        assert_eq!(first.iter().map(|l| l.id).collect::<Vec<_>>(), vec![1, 2]);

        let (rest, cursor) = store
            .task_logs(&task, 10, &[], LogOrder::Ascending, cursor)
            .await
            .unwrap();
        assert_eq!(rest.iter().map(|l| l.id).collect::<Vec<_>>(), vec![3, 4, 5]);

        let (none, same) = store
            .task_logs(&task, 10, &[], LogOrder::Ascending, cursor.clone())
            .await
            .unwrap();
        assert!(none.is_empty());
        assert_eq!(same, cursor);
    }

    #[tokio::test]
    async fn descending_order_serves_newest_first() {
        let store = store_with_logs();
        let (logs, _) = store
            .task_logs(&TaskId::from("t"), 2, &[], LogOrder::Descending, None)
            .await
            .unwrap();
        assert_eq!(logs.iter().map(|l| l.id).collect::<Vec<_>>(), vec![5, 4]);
    }

    #[tokio::test]
    async fn substring_and_time_filters_apply() {
        let store = store_with_logs();
        let filters = [
            Filter {
                field: LogField::Log,
                op: FilterOp::Substring,
                values: FilterValues::Text("memory".into()),
            },
            Filter {
                field: LogField::Timestamp,
                op: FilterOp::GreaterThan,
                values: FilterValues::Time(SystemTime::UNIX_EPOCH + Duration::from_secs(3)),
            },
        ];
        let (logs, _) = store
            .task_logs(&TaskId::from("t"), 10, &filters, LogOrder::Ascending, None)
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].rank_id, Some(9));
    }

    #[tokio::test]
    async fn mismatched_filter_is_rejected() {
        let store = store_with_logs();
        let bogus = [Filter {
            field: LogField::RankId,
            op: FilterOp::Substring,
            values: FilterValues::Text("1".into()),
        }];
        assert!(matches!(
            store.task_logs_count(&TaskId::from("t"), &bogus).await,
            Err(Error::InvalidRequest { .. })
        ));
    }

    #[test]
    fn end_time_is_set_once() {
        let store = MemoryStore::default();
        let id = TaskId::from("t");
        store.insert_task(Task {
            id: id.clone(),
            task_type: allocd_core::types::TaskType::Command,
            start_time: SystemTime::UNIX_EPOCH,
            end_time: None,
        });
        let first = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        assert_eq!(store.end_task(&id, first), Ok(true));
        assert_eq!(
            store.end_task(&id, first + Duration::from_secs(5)),
            Ok(false)
        );
        assert_eq!(store.inner.read().tasks[&id].end_time, Some(first));
    }

    #[tokio::test]
    async fn fields_collect_distinct_values_for_the_task() {
        let store = store_with_logs();
        let fields = store.task_logs_fields(&TaskId::from("t")).await.unwrap();
        assert_eq!(fields.rank_ids.len(), 5);
        assert_eq!(fields.allocation_ids.len(), 1);
        assert!(fields.container_ids.is_empty());
    }
}
