//! Cloud stack provisioning
//!
//! [`watcher::DeploymentWatcher`] is the generic submit-and-poll engine.
//! [`application`] and [`helper`] are the two concrete flows built on it: the
//! application stack first, then the migration helper stack whose parameters
//! are derived from the application stack.

pub mod application;
pub mod helper;
pub mod watcher;

use crate::{Error, Result, orchestrator::Orchestrator};
use async_trait::async_trait;
use migration_state::{InfrastructureDeploymentState, MigrationId};
use std::collections::BTreeMap;
use std::collections::HashMap;
use tracing::{debug, error};

/// Template parameters, keyed by parameter name
pub type StackParameters = BTreeMap<String, String>;

/// Cloud stack provisioning API
#[async_trait]
pub trait StackApi: Send + Sync {
    /// Start creating `stack_name` from a template, returning the stack id
    async fn provision_stack(
        &self,
        template_url: &str,
        stack_name: &str,
        params: &StackParameters,
    ) -> Result<String>;

    /// Current status of a stack
    async fn get_status(&self, stack_name: &str) -> Result<InfrastructureDeploymentState>;

    /// Best-effort explanation of why a stack failed
    async fn get_stack_error_root_cause(&self, stack_name: &str) -> Result<Option<String>>;

    /// Outputs of a stack, keyed by output name
    async fn get_stack_outputs(&self, stack_name: &str) -> Result<HashMap<String, String>>;

    /// Parameters a stack was created with
    async fn get_stack_parameters(&self, stack_name: &str) -> Result<HashMap<String, String>>;

    /// Account-wide exported values, keyed by export name
    async fn get_exports(&self) -> Result<HashMap<String, String>>;

    /// Physical resource ids of a stack, keyed by logical resource id
    async fn get_stack_resources(&self, stack_name: &str) -> Result<HashMap<String, String>>;
}

/// Finds compute instances belonging to provisioned infrastructure
#[async_trait]
pub trait InstanceLocator: Send + Sync {
    /// An instance created by `stack_name`
    async fn instance_for_stack(&self, stack_name: &str) -> Result<Option<String>>;

    /// The first instance of an auto-scaling group
    async fn instance_in_group(&self, group_name: &str) -> Result<Option<String>>;
}

/// Persists the last polled stack status
#[async_trait]
pub trait DeploymentStatusRecorder: Send + Sync {
    /// Store `state` for `migration_id`
    ///
    /// Fails without storing anything when `migration_id` is no longer the
    /// current migration.
    async fn record_deployment_state(
        &self,
        migration_id: MigrationId,
        state: InfrastructureDeploymentState,
    ) -> Result<()>;
}

/// Terminal handlers of a deployment
///
/// Exactly one of the two is called per deployment, exactly once.
#[async_trait]
pub trait DeploymentCallbacks: Send + Sync {
    /// The stack reached its success-terminal status
    async fn on_success(&self);

    /// The stack failed, could not be submitted, or timed out
    async fn on_failure(&self, reason: String);
}

/// Fail `migration_id` unless it has been reset in the meantime
pub(crate) async fn record_failure(
    orchestrator: &Orchestrator,
    migration_id: MigrationId,
    reason: String,
) {
    match orchestrator.error_for(migration_id, reason).await {
        Ok(()) => {}
        Err(Error::MigrationNotCurrent(_)) => {
            debug!("Dropping failure of reset migration {}", migration_id);
        }
        Err(e) => error!("Failed to record migration error: {}", e),
    }
}
