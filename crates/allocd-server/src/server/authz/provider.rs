use allocd_core::{
    Result,
    types::{Experiment, User, UserId},
};

/// Capabilities a caller may need on a trial's experiment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExperimentAction {
    /// Read logs and other artifacts of the experiment's trials.
    ViewArtifacts,
    /// Modify the experiment or drive its allocations.
    Edit,
}

/// Policy backend answering capability questions.
///
/// Methods returning `Result<()>` deny by returning an error, which the
/// gateway replaces with its own sanitized denial.
#[tonic::async_trait]
pub trait AuthzProvider: Send + Sync + 'static {
    /// View-level check; `false` means the caller may not learn the
    /// experiment exists.
    async fn can_get_experiment(&self, user: &User, experiment: &Experiment) -> Result<bool>;

    async fn can_get_experiment_artifacts(&self, user: &User, experiment: &Experiment) -> Result<()>;

    async fn can_edit_experiment(&self, user: &User, experiment: &Experiment) -> Result<()>;

    /// Access to an interactive task launched by `creator`.
    async fn can_access_interactive_task(&self, user: &User, creator: UserId) -> Result<bool>;

    async fn can_get_active_tasks_count(&self, user: &User) -> Result<()>;
}
