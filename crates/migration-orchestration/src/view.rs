//! Read-only snapshots of migration state
//!
//! Views are copies taken under the orchestrator's lock. Changing state goes
//! through [`crate::Orchestrator`], never through a view.

use chrono::Utc;
use migration_state::{
    HelperStackOutputs, InfrastructureDeploymentState, Migration, MigrationContext, MigrationId,
    MigrationStage, RemoteCommandInvocation,
};

/// Snapshot of a migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationView {
    inner: Migration,
}

impl MigrationView {
    pub(crate) fn new(inner: Migration) -> Self {
        Self { inner }
    }

    /// Migration identifier
    pub fn id(&self) -> MigrationId {
        self.inner.id
    }

    /// Stage at snapshot time
    pub fn stage(&self) -> MigrationStage {
        self.inner.stage
    }
}

/// Snapshot of a migration context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextView {
    inner: MigrationContext,
}

impl ContextView {
    pub(crate) fn new(inner: MigrationContext) -> Self {
        Self { inner }
    }

    /// Owning migration
    pub fn migration_id(&self) -> MigrationId {
        self.inner.migration_id
    }

    /// Unix seconds at creation
    pub fn start_epoch(&self) -> i64 {
        self.inner.start_epoch
    }

    /// Unix seconds at finish or failure
    pub fn end_epoch(&self) -> Option<i64> {
        self.inner.end_epoch
    }

    /// Seconds since the migration started
    ///
    /// Measured up to `end_epoch` once the migration finished or failed.
    pub fn elapsed_secs(&self) -> i64 {
        self.elapsed_secs_at(Utc::now().timestamp())
    }

    fn elapsed_secs_at(&self, now: i64) -> i64 {
        (self.inner.end_epoch.unwrap_or(now) - self.inner.start_epoch).max(0)
    }

    /// Failure reason
    pub fn error_message(&self) -> Option<&str> {
        self.inner.error_message.as_deref()
    }

    /// Last polled stack status
    pub fn deployment_state(&self) -> InfrastructureDeploymentState {
        self.inner.deployment_state
    }

    /// Application stack name
    pub fn application_deployment_id(&self) -> Option<&str> {
        self.inner.application_deployment_id.as_deref()
    }

    /// Migration helper stack name
    pub fn helper_stack_deployment_id(&self) -> Option<&str> {
        self.inner.helper_stack_deployment_id.as_deref()
    }

    /// URL of the migrated application
    pub fn service_url(&self) -> Option<&str> {
        self.inner.service_url.as_deref()
    }

    /// Recorded helper stack outputs
    pub fn helper_outputs(&self) -> &HelperStackOutputs {
        &self.inner.helper_outputs
    }

    /// Most recent database restore command
    pub fn restore_invocation(&self) -> Option<&RemoteCommandInvocation> {
        self.inner.restore_invocation.as_ref()
    }
}
