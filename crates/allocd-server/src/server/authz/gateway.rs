//! Resolution of allocations and tasks to their owners, followed by the
//! capability checks of the [`AuthzProvider`].
//!
//! View-level denials are reported as `NotFound` so an unauthorized caller
//! cannot confirm that a task or allocation exists. Action-level denials,
//! evaluated only once viewing passed, are reported as `PermissionDenied`.

use super::provider::{AuthzProvider, ExperimentAction};
use crate::server::{allocation::AllocationRegistry, backend::TaskStore};
use allocd_core::{
    Error, Result,
    types::{AllocationId, Experiment, TaskId, TaskType, User},
};
use std::sync::Arc;

/// Who an allocation belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// A trial of this experiment.
    Experiment(Experiment),
    /// A freestanding interactive task or a maintenance task.
    Interactive,
}

#[derive(Clone)]
pub struct AuthzGateway {
    provider: Arc<dyn AuthzProvider>,
    store: Arc<dyn TaskStore>,
    registry: AllocationRegistry,
}

impl AuthzGateway {
    pub fn new(
        provider: Arc<dyn AuthzProvider>,
        store: Arc<dyn TaskStore>,
        registry: AllocationRegistry,
    ) -> Self {
        Self {
            provider,
            store,
            registry,
        }
    }

    /// Looks up who owns `allocation`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the allocation is not registered or its
    /// experiment no longer exists.
    pub async fn resolve_ownership(&self, allocation: &AllocationId) -> Result<Ownership> {
        let entry = self.registry.get(allocation)?;
        let Some(experiment_id) = entry.experiment_id else {
            return Ok(Ownership::Interactive);
        };
        let experiment = self
            .store
            .experiment_by_id(experiment_id)
            .await?
            .ok_or_else(|| Error::not_found("allocation", allocation))?;
        Ok(Ownership::Experiment(experiment))
    }

    /// Checks that `user` may see `task` and perform every one of `actions`
    /// on its experiment.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the task does not exist or the caller may not
    ///   view it.
    /// - [`Error::PermissionDenied`] for the first action the caller lacks.
    pub async fn can_act_on_task(
        &self,
        user: &User,
        task_id: &TaskId,
        actions: &[ExperimentAction],
    ) -> Result<()> {
        let task_not_found = || Error::not_found("task", task_id);
        let task = self
            .store
            .task_by_id(task_id)
            .await?
            .ok_or_else(task_not_found)?;

        if task.task_type != TaskType::Trial {
            return if self.can_access_interactive_task(user, task_id).await? {
                Ok(())
            } else {
                Err(task_not_found())
            };
        }

        let experiment = self
            .store
            .experiment_by_task(task_id)
            .await?
            .ok_or_else(task_not_found)?;
        if !self.provider.can_get_experiment(user, &experiment).await? {
            return Err(task_not_found());
        }

        for action in actions {
            let allowed = match action {
                ExperimentAction::ViewArtifacts => {
                    self.provider
                        .can_get_experiment_artifacts(user, &experiment)
                        .await
                }
                ExperimentAction::Edit => self.provider.can_edit_experiment(user, &experiment).await,
            };
            allowed.map_err(denied)?;
        }
        Ok(())
    }

    /// Checks that `user` may drive `allocation` (readiness, proxy address,
    /// rendezvous).
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the allocation is unknown or the caller may
    ///   not view it.
    /// - [`Error::PermissionDenied`] if the caller may view but not edit its
    ///   experiment.
    pub async fn can_edit_allocation(&self, user: &User, allocation: &AllocationId) -> Result<()> {
        let not_found = || Error::not_found("allocation", allocation);

        match self.resolve_ownership(allocation).await? {
            Ownership::Interactive => {
                if self
                    .can_access_interactive_task(user, &allocation.task_id())
                    .await?
                {
                    Ok(())
                } else {
                    Err(not_found())
                }
            }
            Ownership::Experiment(experiment) => {
                if !self.provider.can_get_experiment(user, &experiment).await? {
                    return Err(not_found());
                }
                self.provider
                    .can_edit_experiment(user, &experiment)
                    .await
                    .map_err(denied)
            }
        }
    }

    /// # Errors
    ///
    /// [`Error::PermissionDenied`] if the provider refuses.
    pub async fn can_get_active_tasks_count(&self, user: &User) -> Result<()> {
        self.provider
            .can_get_active_tasks_count(user)
            .await
            .map_err(denied)
    }

    /// Tasks without a recorded creator (maintenance tasks) are accessible to
    /// everyone.
    async fn can_access_interactive_task(&self, user: &User, task_id: &TaskId) -> Result<bool> {
        match self.store.task_creator(task_id).await? {
            None => Ok(true),
            Some(creator) => self.provider.can_access_interactive_task(user, creator).await,
        }
    }
}

fn denied(err: Error) -> Error {
    match err {
        Error::PermissionDenied { .. } => err,
        other => Error::PermissionDenied {
            reason: other.to_string(),
        },
    }
}
