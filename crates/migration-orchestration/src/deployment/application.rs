//! Application stack deployment
//!
//! Deploys the application template, and once it is up, derives the helper
//! stack parameters from its outputs, parameters, exports and nested stack
//! resources before handing over to
//! [`MigrationHelperDeploymentService`].

use crate::{
    Error, Result,
    config::DeploymentConfig,
    deployment::{
        DeploymentCallbacks, StackParameters, record_failure,
        helper::MigrationHelperDeploymentService,
        watcher::{DeploymentHandle, DeploymentWatcher},
    },
    orchestrator::Orchestrator,
};
use async_trait::async_trait;
use migration_state::{InfrastructureDeploymentState, MigrationId, MigrationStage};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

const SERVICE_URL_OUTPUT: &str = "ServiceURL";
const DATABASE_ENDPOINT_ADDRESS_OUTPUT: &str = "DBEndpointAddress";
const SECURITY_GROUP_NAME_OUTPUT: &str = "SGname";
const EXPORT_PREFIX_PARAMETER: &str = "ExportPrefix";
const APPLICATION_NESTED_STACK_RESOURCE: &str = "JiraDCStack";
const FILE_SYSTEM_RESOURCE: &str = "ElasticFileSystem";

/// Export prefix used when the application stack does not set one
pub const DEFAULT_EXPORT_PREFIX: &str = "ATL-";

/// Deploys the application stack
pub struct ApplicationDeploymentService {
    orchestrator: Arc<Orchestrator>,
    watcher: Arc<DeploymentWatcher>,
    helper: Arc<MigrationHelperDeploymentService>,
    template_url: String,
    helper_instance_type: String,
}

impl ApplicationDeploymentService {
    /// Create the service
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        watcher: Arc<DeploymentWatcher>,
        helper: Arc<MigrationHelperDeploymentService>,
        config: &DeploymentConfig,
    ) -> Self {
        Self {
            orchestrator,
            watcher,
            helper,
            template_url: config.application_template_url.clone(),
            helper_instance_type: config.helper_instance_type.clone(),
        }
    }

    /// Deploy the application stack named `stack_name`
    ///
    /// Moves to `PROVISION_APPLICATION_WAIT` and records the stack name before
    /// submitting. Success moves on to `PROVISION_MIGRATION_STACK` and starts
    /// the helper deployment; failure moves the migration to `ERROR`.
    pub async fn deploy_application(
        &self,
        stack_name: &str,
        params: StackParameters,
    ) -> Result<DeploymentHandle> {
        info!("Received request to deploy application stack {}", stack_name);
        let migration_id = self.orchestrator.current_migration().await?.id();
        self.orchestrator
            .transition_for(migration_id, MigrationStage::ProvisionApplicationWait)
            .await?;
        self.orchestrator
            .set_application_deployment_id(stack_name)
            .await?;

        let callbacks = Arc::new(ApplicationCallbacks {
            migration_id,
            orchestrator: self.orchestrator.clone(),
            watcher: self.watcher.clone(),
            helper: self.helper.clone(),
            stack_name: stack_name.to_string(),
            helper_instance_type: self.helper_instance_type.clone(),
        });

        self.watcher
            .deploy(migration_id, &self.template_url, stack_name, &params, callbacks)
            .await
    }

    /// Last recorded status of the stack being deployed
    pub async fn deployment_status(&self) -> Result<InfrastructureDeploymentState> {
        Ok(self.orchestrator.current_context().await?.deployment_state())
    }
}

struct ApplicationCallbacks {
    migration_id: MigrationId,
    orchestrator: Arc<Orchestrator>,
    watcher: Arc<DeploymentWatcher>,
    helper: Arc<MigrationHelperDeploymentService>,
    stack_name: String,
    helper_instance_type: String,
}

impl ApplicationCallbacks {
    async fn provision_helper(&self) -> Result<()> {
        self.orchestrator
            .transition_for(self.migration_id, MigrationStage::ProvisionMigrationStack)
            .await?;

        let stacks = self.watcher.stacks();
        let outputs = stacks.get_stack_outputs(&self.stack_name).await?;

        info!("Storing service URL in migration context");
        self.orchestrator
            .set_service_url(self.migration_id, outputs.get(SERVICE_URL_OUTPUT).cloned())
            .await?;

        let export_prefix = stacks
            .get_stack_parameters(&self.stack_name)
            .await?
            .remove(EXPORT_PREFIX_PARAMETER)
            .unwrap_or_else(|| DEFAULT_EXPORT_PREFIX.to_string());
        let exports = stacks.get_exports().await?;

        let resources = stacks.get_stack_resources(&self.stack_name).await?;
        let nested_stack = lookup(&resources, APPLICATION_NESTED_STACK_RESOURCE, "stack resource")?;
        let nested_resources = stacks.get_stack_resources(&nested_stack).await?;
        let file_system_id = lookup(&nested_resources, FILE_SYSTEM_RESOURCE, "stack resource")?;

        let params = helper_parameters(
            &outputs,
            &exports,
            &export_prefix,
            &file_system_id,
            &self.helper_instance_type,
        )?;
        debug!("Derived migration helper parameters: {:?}", params);

        self.helper
            .deploy_for_migration(self.migration_id, params)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DeploymentCallbacks for ApplicationCallbacks {
    async fn on_success(&self) {
        debug!("Application stack {} deployment succeeded", self.stack_name);
        match self.provision_helper().await {
            Ok(()) => {}
            Err(Error::MigrationNotCurrent(id)) => {
                info!(
                    "Migration {} was reset, not provisioning the helper stack of {}",
                    id, self.stack_name
                );
            }
            Err(e) => {
                error!(
                    "Error provisioning migration helper after application stack {}: {}",
                    self.stack_name, e
                );
                // A rejected helper submission has already failed the migration
                let already_failed = matches!(
                    self.orchestrator.is_current(self.migration_id).await,
                    Ok(true)
                ) && self.orchestrator.current_stage().await.ok()
                    == Some(MigrationStage::Error);
                if !already_failed {
                    record_failure(&self.orchestrator, self.migration_id, e.to_string()).await;
                }
            }
        }
    }

    async fn on_failure(&self, reason: String) {
        error!("Application stack {} deployment failed", self.stack_name);
        record_failure(&self.orchestrator, self.migration_id, reason).await;
    }
}

fn lookup(map: &HashMap<String, String>, key: &str, kind: &str) -> Result<String> {
    map.get(key).cloned().ok_or_else(|| {
        Error::InfrastructureDeployment(format!(
            "application stack has no {} named {}",
            kind, key
        ))
    })
}

/// Parameters for the helper stack derived from the application stack
pub fn helper_parameters(
    outputs: &HashMap<String, String>,
    exports: &HashMap<String, String>,
    export_prefix: &str,
    file_system_id: &str,
    helper_instance_type: &str,
) -> Result<StackParameters> {
    let private_subnets = lookup(exports, &format!("{}PriNets", export_prefix), "export")?;
    let first_subnet = private_subnets
        .split(',')
        .next()
        .unwrap_or_default()
        .to_string();
    let vpc_id = lookup(exports, &format!("{}VPCID", export_prefix), "export")?;
    let security_group = lookup(outputs, SECURITY_GROUP_NAME_OUTPUT, "output")?;
    let database_endpoint = lookup(outputs, DATABASE_ENDPOINT_ADDRESS_OUTPUT, "output")?;

    let mut params = StackParameters::new();
    params.insert("NetworkPrivateSubnet".to_string(), first_subnet);
    params.insert("EFSFileSystemId".to_string(), file_system_id.to_string());
    params.insert("EFSSecurityGroup".to_string(), security_group.clone());
    params.insert("RDSSecurityGroup".to_string(), security_group);
    params.insert("RDSEndpoint".to_string(), database_endpoint);
    params.insert(
        "HelperInstanceType".to_string(),
        helper_instance_type.to_string(),
    );
    params.insert("HelperVpcId".to_string(), vpc_id);
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_helper_parameters_use_first_private_subnet() {
        let outputs = map(&[
            ("ServiceURL", "https://jira.example.com"),
            ("DBEndpointAddress", "db.internal"),
            ("SGname", "sg-123"),
        ]);
        let exports = map(&[
            ("CUSTOM-PriNets", "subnet-a,subnet-b"),
            ("CUSTOM-VPCID", "vpc-9"),
        ]);

        let params = helper_parameters(&outputs, &exports, "CUSTOM-", "fs-1", "c5.large").unwrap();
        assert_eq!(params["NetworkPrivateSubnet"], "subnet-a");
        assert_eq!(params["HelperVpcId"], "vpc-9");
        assert_eq!(params["EFSFileSystemId"], "fs-1");
        assert_eq!(params["EFSSecurityGroup"], "sg-123");
        assert_eq!(params["RDSSecurityGroup"], "sg-123");
        assert_eq!(params["RDSEndpoint"], "db.internal");
        assert_eq!(params["HelperInstanceType"], "c5.large");
    }

    #[test]
    fn test_missing_export_is_an_infrastructure_error() {
        let outputs = map(&[("DBEndpointAddress", "db"), ("SGname", "sg")]);
        let err = helper_parameters(&outputs, &HashMap::new(), "ATL-", "fs", "c5.large").unwrap_err();
        assert!(matches!(err, Error::InfrastructureDeployment(_)));
        assert!(err.to_string().contains("ATL-PriNets"));
    }
}
