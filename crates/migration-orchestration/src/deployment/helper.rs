//! Migration helper stack deployment
//!
//! The helper stack hosts the instance, documents and bucket used to hydrate
//! the new application deployment. Its outputs are persisted in the migration
//! context so later stages can resolve them after a restart.

use crate::{
    Error, Result,
    config::{DeploymentConfig, HelperOverrides},
    deployment::{
        DeploymentCallbacks, InstanceLocator, StackParameters, record_failure,
        watcher::{DeploymentHandle, DeploymentWatcher},
    },
    orchestrator::Orchestrator,
};
use async_trait::async_trait;
use migration_state::{
    HelperStackOutputs, InfrastructureDeploymentState, MigrationId, MigrationStage,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info};

const FS_RESTORE_DOCUMENT_OUTPUT: &str = "DownloadSSMDocument";
const FS_RESTORE_STATUS_DOCUMENT_OUTPUT: &str = "DownloadStatusSSMDocument";
const RDS_RESTORE_DOCUMENT_OUTPUT: &str = "RdsRestoreSSMDocument";
const SERVER_GROUP_OUTPUT: &str = "ServerGroup";
const MIGRATION_BUCKET_OUTPUT: &str = "MigrationBucket";

/// Suffix appended to the application stack name
pub const HELPER_STACK_SUFFIX: &str = "-migration";

/// Deploys the migration helper stack and serves its outputs
pub struct MigrationHelperDeploymentService {
    orchestrator: Arc<Orchestrator>,
    watcher: Arc<DeploymentWatcher>,
    instances: Arc<dyn InstanceLocator>,
    template_url: String,
    overrides: HelperOverrides,
    pending: Mutex<Option<DeploymentHandle>>,
}

impl MigrationHelperDeploymentService {
    /// Create the service
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        watcher: Arc<DeploymentWatcher>,
        instances: Arc<dyn InstanceLocator>,
        config: &DeploymentConfig,
        overrides: HelperOverrides,
    ) -> Self {
        Self {
            orchestrator,
            watcher,
            instances,
            template_url: config.helper_template_url.clone(),
            overrides,
            pending: Mutex::new(None),
        }
    }

    /// Deploy the helper stack as `<application-stack>-migration`
    ///
    /// Requires the current stage to be `PROVISION_MIGRATION_STACK`. Moves to
    /// `PROVISION_MIGRATION_STACK_WAIT` before submitting, and on to
    /// `FS_MIGRATION_COPY` once the stack is created and its outputs are
    /// stored.
    pub async fn deploy_migration_infrastructure(
        &self,
        params: StackParameters,
    ) -> Result<DeploymentHandle> {
        let migration_id = self.orchestrator.current_migration().await?.id();
        self.deploy_for_migration(migration_id, params).await
    }

    /// [`Self::deploy_migration_infrastructure`] for `migration_id` only
    pub(crate) async fn deploy_for_migration(
        &self,
        migration_id: MigrationId,
        params: StackParameters,
    ) -> Result<DeploymentHandle> {
        if !self.orchestrator.is_current(migration_id).await? {
            return Err(Error::MigrationNotCurrent(migration_id));
        }
        let context = self.orchestrator.current_context().await?;
        self.orchestrator
            .assert_current_stage(MigrationStage::ProvisionMigrationStack)
            .await?;

        let application_stack = context.application_deployment_id().ok_or_else(|| {
            Error::InfrastructureDeployment(
                "application stack name is not recorded for this migration".to_string(),
            )
        })?;
        let stack_name = format!("{}{}", application_stack, HELPER_STACK_SUFFIX);

        self.orchestrator
            .set_helper_outputs(migration_id, HelperStackOutputs::default())
            .await?;
        self.orchestrator
            .set_helper_stack_deployment_id(&stack_name)
            .await?;
        self.orchestrator
            .transition_for(migration_id, MigrationStage::ProvisionMigrationStackWait)
            .await?;

        info!("Deploying migration helper stack {}", stack_name);
        let callbacks = Arc::new(HelperCallbacks {
            migration_id,
            orchestrator: self.orchestrator.clone(),
            watcher: self.watcher.clone(),
            stack_name: stack_name.clone(),
        });
        let handle = self
            .watcher
            .deploy(migration_id, &self.template_url, &stack_name, &params, callbacks)
            .await?;

        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle.clone());
        Ok(handle)
    }

    /// Handle of the most recent helper deployment started by this service
    pub fn pending_deployment(&self) -> Option<DeploymentHandle> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Document that downloads shared files onto the helper instance
    pub async fn fs_restore_document(&self) -> Result<String> {
        self.output_or_override(&self.overrides.fs_restore_document, |o| {
            &o.fs_restore_document
        })
        .await
    }

    /// Document that reports file download progress
    pub async fn fs_restore_status_document(&self) -> Result<String> {
        self.output_or_override(&self.overrides.fs_restore_status_document, |o| {
            &o.fs_restore_status_document
        })
        .await
    }

    /// Document that restores the database
    pub async fn db_restore_document(&self) -> Result<String> {
        self.output_or_override(&self.overrides.rds_restore_document, |o| {
            &o.rds_restore_document
        })
        .await
    }

    /// Bucket holding migration artifacts
    pub async fn migration_bucket_name(&self) -> Result<String> {
        self.output_or_override(&self.overrides.migration_bucket_name, |o| {
            &o.migration_bucket_name
        })
        .await
    }

    /// Instance the helper documents run on
    pub async fn migration_host_instance_id(&self) -> Result<String> {
        if let Some(instance_id) = &self.overrides.instance_id {
            return Ok(instance_id.clone());
        }

        let outputs = self.recorded_outputs().await?;
        let group = require(&outputs.migration_stack_asg)?;

        self.instances
            .instance_in_group(&group)
            .await?
            .ok_or_else(|| {
                Error::InfrastructureDeployment(format!(
                    "no instance found in migration auto-scaling group {}",
                    group
                ))
            })
    }

    /// Last recorded status of the stack being deployed
    pub async fn deployment_status(&self) -> Result<InfrastructureDeploymentState> {
        Ok(self.orchestrator.current_context().await?.deployment_state())
    }

    async fn output_or_override(
        &self,
        override_value: &Option<String>,
        select: impl Fn(&HelperStackOutputs) -> &Option<String>,
    ) -> Result<String> {
        if let Some(value) = override_value {
            return Ok(value.clone());
        }
        let outputs = self.recorded_outputs().await?;
        require(select(&outputs))
    }

    /// Outputs of the helper stack, failing unless every one is set
    async fn recorded_outputs(&self) -> Result<HelperStackOutputs> {
        let context = self.orchestrator.current_context().await?;
        let outputs = context.helper_outputs().clone();

        let all_set = [
            &outputs.fs_restore_document,
            &outputs.fs_restore_status_document,
            &outputs.rds_restore_document,
            &outputs.migration_bucket_name,
            &outputs.migration_stack_asg,
        ]
        .iter()
        .all(|output| output.as_deref().is_some_and(|v| !v.is_empty()));

        if !all_set {
            return Err(outputs_not_set());
        }
        Ok(outputs)
    }
}

fn require(value: &Option<String>) -> Result<String> {
    value.clone().ok_or_else(outputs_not_set)
}

fn outputs_not_set() -> Error {
    Error::InfrastructureDeployment("migration stack outputs are not set".to_string())
}

/// Builds the persisted outputs from raw stack outputs
pub fn helper_outputs_from(outputs: &HashMap<String, String>) -> HelperStackOutputs {
    let get = |key: &str| outputs.get(key).cloned();
    HelperStackOutputs {
        fs_restore_document: get(FS_RESTORE_DOCUMENT_OUTPUT),
        fs_restore_status_document: get(FS_RESTORE_STATUS_DOCUMENT_OUTPUT),
        rds_restore_document: get(RDS_RESTORE_DOCUMENT_OUTPUT),
        migration_stack_asg: get(SERVER_GROUP_OUTPUT),
        migration_bucket_name: get(MIGRATION_BUCKET_OUTPUT),
    }
}

struct HelperCallbacks {
    migration_id: MigrationId,
    orchestrator: Arc<Orchestrator>,
    watcher: Arc<DeploymentWatcher>,
    stack_name: String,
}

impl HelperCallbacks {
    async fn store_outputs_and_advance(&self) -> Result<()> {
        let outputs = self
            .watcher
            .stacks()
            .get_stack_outputs(&self.stack_name)
            .await?;
        debug!("Migration helper stack outputs: {:?}", outputs);

        self.orchestrator
            .set_helper_outputs(self.migration_id, helper_outputs_from(&outputs))
            .await?;
        self.orchestrator
            .transition_for(self.migration_id, MigrationStage::FsMigrationCopy)
            .await
    }
}

#[async_trait]
impl DeploymentCallbacks for HelperCallbacks {
    async fn on_success(&self) {
        if let Err(e) = self.store_outputs_and_advance().await {
            error!(
                "Error finishing migration helper stack deployment {}: {}",
                self.stack_name, e
            );
            record_failure(&self.orchestrator, self.migration_id, e.to_string()).await;
        }
    }

    async fn on_failure(&self, reason: String) {
        record_failure(&self.orchestrator, self.migration_id, reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outputs_are_mapped_by_key() {
        let raw: HashMap<String, String> = [
            ("DownloadSSMDocument", "fs-doc"),
            ("DownloadStatusSSMDocument", "fs-status-doc"),
            ("RdsRestoreSSMDocument", "rds-doc"),
            ("ServerGroup", "helper-asg"),
            ("MigrationBucket", "bucket"),
            ("Unrelated", "ignored"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let outputs = helper_outputs_from(&raw);
        assert_eq!(outputs.fs_restore_document.as_deref(), Some("fs-doc"));
        assert_eq!(outputs.fs_restore_status_document.as_deref(), Some("fs-status-doc"));
        assert_eq!(outputs.rds_restore_document.as_deref(), Some("rds-doc"));
        assert_eq!(outputs.migration_stack_asg.as_deref(), Some("helper-asg"));
        assert_eq!(outputs.migration_bucket_name.as_deref(), Some("bucket"));
    }

    #[test]
    fn test_missing_outputs_stay_unset() {
        let outputs = helper_outputs_from(&HashMap::new());
        assert!(outputs.is_empty());
    }
}
