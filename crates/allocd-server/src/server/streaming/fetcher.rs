//! Backend-facing fetchers plugged into the [`BatchStreamProcessor`].
//!
//! [`BatchStreamProcessor`]: super::processor::BatchStreamProcessor

use super::{
    batch::{BatchRequest, effective_limit},
    filter::Filter,
    processor::{BatchFetch, TerminationCheck},
};
use crate::server::{
    authz::{AuthRecheck, AuthzGateway, ExperimentAction},
    backend::{Cursor, TaskLogBackend, TaskStore},
};
use allocd_core::{
    Error, Result,
    types::{LogOrder, TaskId, TaskLog, TaskLogFields, User},
};
use core::time::Duration;
use std::{sync::Arc, time::SystemTime};

/// Reconciles the client's paging parameters with what the backend holds
/// right now.
///
/// Following streams are unbounded and skip the count.
///
/// # Errors
///
/// Propagates backend count failures.
pub async fn resolve_request(
    backend: &dyn TaskLogBackend,
    task_id: &TaskId,
    filters: &[Filter],
    limit: i64,
    follow: bool,
) -> Result<BatchRequest> {
    if follow {
        return Ok(BatchRequest::new(0, true));
    }
    let total = backend.task_logs_count(task_id, filters).await?;
    Ok(BatchRequest::new(effective_limit(limit, 0, total), false))
}

/// Pages through the logs of one task, threading the backend cursor between
/// calls.
pub struct TaskLogsFetch {
    backend: Arc<dyn TaskLogBackend>,
    task_id: TaskId,
    filters: Vec<Filter>,
    order: LogOrder,
    cursor: Option<Cursor>,
}

impl TaskLogsFetch {
    pub fn new(
        backend: Arc<dyn TaskLogBackend>,
        task_id: TaskId,
        filters: Vec<Filter>,
        order: LogOrder,
    ) -> Self {
        Self {
            backend,
            task_id,
            filters,
            order,
            cursor: None,
        }
    }
}

#[tonic::async_trait]
impl BatchFetch<TaskLog> for TaskLogsFetch {
    async fn fetch(&mut self, req: BatchRequest) -> Result<Vec<TaskLog>> {
        let limit = usize::try_from(req.limit).unwrap_or(0);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let (logs, cursor) = self
            .backend
            .task_logs(
                &self.task_id,
                limit,
                &self.filters,
                self.order,
                self.cursor.clone(),
            )
            .await?;
        self.cursor = cursor;
        Ok(logs)
    }
}

/// Snapshots the distinct field values of one task's logs.
pub struct TaskLogFieldsFetch {
    backend: Arc<dyn TaskLogBackend>,
    task_id: TaskId,
}

impl TaskLogFieldsFetch {
    pub fn new(backend: Arc<dyn TaskLogBackend>, task_id: TaskId) -> Self {
        Self { backend, task_id }
    }
}

#[tonic::async_trait]
impl BatchFetch<TaskLogFields> for TaskLogFieldsFetch {
    async fn fetch(&mut self, _req: BatchRequest) -> Result<Vec<TaskLogFields>> {
        let fields = self.backend.task_logs_fields(&self.task_id).await?;
        Ok(vec![fields])
    }
}

/// Re-runs the task authorization chain before a fetch whenever the
/// [`AuthRecheck`] period has elapsed.
pub struct AuthorizedFetch<F> {
    inner: F,
    gateway: AuthzGateway,
    user: User,
    task_id: TaskId,
    actions: Vec<ExperimentAction>,
    recheck: AuthRecheck,
}

impl<F> AuthorizedFetch<F> {
    pub fn new(
        inner: F,
        gateway: AuthzGateway,
        user: User,
        task_id: TaskId,
        actions: Vec<ExperimentAction>,
        recheck: AuthRecheck,
    ) -> Self {
        Self {
            inner,
            gateway,
            user,
            task_id,
            actions,
            recheck,
        }
    }
}

#[tonic::async_trait]
impl<T, F> BatchFetch<T> for AuthorizedFetch<F>
where
    T: Send + 'static,
    F: BatchFetch<T>,
{
    async fn fetch(&mut self, req: BatchRequest) -> Result<Vec<T>> {
        if self.recheck.is_due() {
            tracing::debug!("re-authorizing {} on task {}", self.user.username, self.task_id);
            self.gateway
                .can_act_on_task(&self.user, &self.task_id, &self.actions)
                .await?;
            self.recheck.mark_checked();
        }
        self.inner.fetch(req).await
    }
}

/// A task is terminal once its end time plus the backend's maximum
/// termination delay lies in the past.
pub struct TaskTerminalCheck {
    store: Arc<dyn TaskStore>,
    task_id: TaskId,
    delay: Duration,
}

impl TaskTerminalCheck {
    pub fn new(store: Arc<dyn TaskStore>, task_id: TaskId, delay: Duration) -> Self {
        Self {
            store,
            task_id,
            delay,
        }
    }
}

#[tonic::async_trait]
impl TerminationCheck for TaskTerminalCheck {
    async fn is_terminal(&mut self) -> Result<bool> {
        let task = self
            .store
            .task_by_id(&self.task_id)
            .await?
            .ok_or_else(|| Error::not_found("task", &self.task_id))?;

        Ok(task
            .end_time
            .and_then(|end| end.checked_add(self.delay))
            .is_some_and(|settled| settled < SystemTime::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{
        allocation::AllocationRegistry,
        authz::gateway::tests::{StubAuthz, seeded_store, user},
        backend::memory::MemoryStore,
    };
    use allocd_core::types::{AllocationId, LogLevel};

    fn line(task: &str, text: &str) -> TaskLog {
        TaskLog {
            id: 0,
            task_id: TaskId::from(task),
            allocation_id: Some(AllocationId::from(format!("{task}.0"))),
            agent_id: None,
            container_id: None,
            rank_id: Some(0),
            timestamp: SystemTime::UNIX_EPOCH,
            level: LogLevel::Info,
            log: text.into(),
            source: None,
            stdtype: None,
        }
    }

    #[tokio::test]
    async fn resolve_request_caps_limit_by_total() {
        let store = MemoryStore::default();
        for _ in 0..3 {
            store.append_log(line("t", "x"));
        }
        let task = TaskId::from("t");

        let req = resolve_request(&store, &task, &[], 10, false).await.unwrap();
        assert_eq!(req, BatchRequest::new(3, false));
        let req = resolve_request(&store, &task, &[], 0, false).await.unwrap();
        assert_eq!(req, BatchRequest::new(3, false));
        let req = resolve_request(&store, &TaskId::from("empty"), &[], 0, false)
            .await
            .unwrap();
        assert_eq!(req.limit, 0);
        let req = resolve_request(&store, &task, &[], 0, true).await.unwrap();
        assert!(req.follow);
    }

    #[tokio::test]
    async fn logs_fetch_advances_the_cursor() {
        let store = Arc::new(MemoryStore::default());
        for i in 0..5 {
            store.append_log(line("t", &i.to_string()));
        }
        let mut fetch = TaskLogsFetch::new(store, TaskId::from("t"), Vec::new(), LogOrder::Ascending);

        let first = fetch.fetch(BatchRequest::new(2, false)).await.unwrap();
        let second = fetch.fetch(BatchRequest::new(10, false)).await.unwrap();
        let third = fetch.fetch(BatchRequest::new(10, false)).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 3);
        assert!(third.is_empty());
        assert!(fetch.fetch(BatchRequest::new(0, false)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminal_check_honours_termination_delay() {
        let store = seeded_store();
        let nb = TaskId::from("nb");

        let mut check = TaskTerminalCheck::new(store.clone(), nb.clone(), Duration::ZERO);
        assert!(!check.is_terminal().await.unwrap());

        store
            .end_task(&nb, SystemTime::now() - Duration::from_secs(10))
            .unwrap();
        assert!(check.is_terminal().await.unwrap());

        let mut delayed = TaskTerminalCheck::new(store, nb, Duration::from_secs(3600));
        assert!(!delayed.is_terminal().await.unwrap());
    }

    #[tokio::test]
    async fn terminal_check_of_missing_task_fails() {
        let mut check = TaskTerminalCheck::new(seeded_store(), TaskId::from("gone"), Duration::ZERO);
        assert!(matches!(
            check.is_terminal().await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn revocation_is_noticed_at_the_next_recheck() {
        let store = seeded_store();
        let provider = Arc::new(StubAuthz::default());
        let registry = AllocationRegistry::new(4, Duration::from_secs(1));
        let gateway = AuthzGateway::new(provider.clone(), store.clone(), registry);
        let period = Duration::from_secs(300);

        let mut fetch = AuthorizedFetch::new(
            TaskLogFieldsFetch::new(store, TaskId::from("trial")),
            gateway,
            user(2),
            TaskId::from("trial"),
            vec![ExperimentAction::ViewArtifacts],
            AuthRecheck::checked_now(period),
        );

        provider.deny(ExperimentAction::ViewArtifacts);
        tokio::time::advance(Duration::from_secs(299)).await;
        let within: Result<Vec<TaskLogFields>> = fetch.fetch(BatchRequest::default()).await;
        assert!(within.is_ok());

        tokio::time::advance(Duration::from_secs(1)).await;
        let after: Result<Vec<TaskLogFields>> = fetch.fetch(BatchRequest::default()).await;
        assert!(matches!(
            after,
            Err(Error::PermissionDenied { .. })
        ));
    }
}
