use super::provider::AuthzProvider;
use allocd_core::{
    Result,
    types::{Experiment, User, UserId},
};

/// Permissive policy: any authenticated user may do anything, except that in
/// strict mode interactive tasks are restricted to admins and their creator.
#[derive(Clone, Copy, Debug, Default)]
pub struct BasicAuthz {
    strict_interactive_tasks: bool,
}

impl BasicAuthz {
    pub const fn new(strict_interactive_tasks: bool) -> Self {
        Self {
            strict_interactive_tasks,
        }
    }
}

#[tonic::async_trait]
impl AuthzProvider for BasicAuthz {
    async fn can_get_experiment(&self, _user: &User, _experiment: &Experiment) -> Result<bool> {
        Ok(true)
    }

    async fn can_get_experiment_artifacts(&self, _user: &User, _experiment: &Experiment) -> Result<()> {
        Ok(())
    }

    async fn can_edit_experiment(&self, _user: &User, _experiment: &Experiment) -> Result<()> {
        Ok(())
    }

    async fn can_access_interactive_task(&self, user: &User, creator: UserId) -> Result<bool> {
        if !self.strict_interactive_tasks {
            return Ok(true);
        }
        Ok(user.admin || user.id == creator)
    }

    async fn can_get_active_tasks_count(&self, _user: &User) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: UserId, admin: bool) -> User {
        User {
            id,
            username: format!("user{id}"),
            admin,
        }
    }

    #[tokio::test]
    async fn relaxed_mode_allows_everyone() {
        let authz = BasicAuthz::new(false);
        assert!(authz.can_access_interactive_task(&user(1, false), 2).await.unwrap());
    }

    #[tokio::test]
    async fn strict_mode_allows_only_admins_and_creator() {
        let authz = BasicAuthz::new(true);
        assert!(authz.can_access_interactive_task(&user(2, false), 2).await.unwrap());
        assert!(authz.can_access_interactive_task(&user(1, true), 2).await.unwrap());
        assert!(!authz.can_access_interactive_task(&user(1, false), 2).await.unwrap());
    }
}
