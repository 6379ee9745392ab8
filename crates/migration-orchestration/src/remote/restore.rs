//! Database restore on the migration helper instance

use crate::{
    Error, Result,
    deployment::helper::MigrationHelperDeploymentService,
    orchestrator::Orchestrator,
    remote::{
        CommandParameters, CommandStatus,
        runner::{RemoteCommandInvocation, RemoteCommandRunner},
        service::{ApplicationServiceController, with_service_stopped},
    },
};
use migration_state::MigrationStage;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Name of the restore document as it appears in command output keys
pub const RESTORE_DOCUMENT_NAME: &str = "restoreDatabaseBackupToRDS";

const RESTORE_FAILURE_MESSAGE: &str =
    "Error restoring database. Either download of database dump from S3 failed or pg_restore failed";

/// Result of the last restore command, for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreCommandResult {
    /// Console location of the command output
    pub console_url: String,
    /// Captured standard error
    pub error_message: Option<String>,
    /// Whether stderr matched a fatal pattern
    pub critical_error: bool,
    /// Status when queried
    pub status: CommandStatus,
}

/// Restores the application database from the uploaded dump
pub struct DatabaseRestoreService {
    orchestrator: Arc<Orchestrator>,
    helper: Arc<MigrationHelperDeploymentService>,
    runner: Arc<RemoteCommandRunner>,
    controller: Arc<ApplicationServiceController>,
}

impl DatabaseRestoreService {
    /// Create the service
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        helper: Arc<MigrationHelperDeploymentService>,
        runner: Arc<RemoteCommandRunner>,
        controller: Arc<ApplicationServiceController>,
    ) -> Self {
        Self {
            orchestrator,
            helper,
            runner,
            controller,
        }
    }

    /// Run the restore document and wait for it to finish
    ///
    /// Requires `DATA_MIGRATION_IMPORT` and ends in `VALIDATE`. The
    /// application service is stopped for the duration of the restore and
    /// started again afterwards regardless of the outcome. Any failure once
    /// the restore has been started moves the migration to `ERROR`.
    pub async fn restore_database(&self) -> Result<()> {
        let (document, instance_id) = self.resolve_target().await?;
        self.orchestrator
            .assert_current_stage(MigrationStage::DataMigrationImport)
            .await?;

        info!("Restoring database on migration host {}", instance_id);
        let result = with_service_stopped(&self.controller, || {
            self.run_restore(&document, &instance_id)
        })
        .await;

        if let Err(e) = &result {
            error!("Database restore failed: {}", e);
            if let Err(record_err) = self.orchestrator.error_from(e).await {
                error!("Failed to record migration error: {}", record_err);
            }
        }
        result
    }

    /// Status and output location of the last restore command
    ///
    /// The invocation is read from the migration context, so a restore
    /// started before a restart can still be queried.
    pub async fn fetch_command_result(&self) -> Result<RestoreCommandResult> {
        let invocation = self.last_invocation().await?.ok_or_else(|| {
            Error::CommandNotInitialised("database restore command was not executed".to_string())
        })?;

        let bucket = self.helper.migration_bucket_name().await?;
        let result = self
            .runner
            .fetch_result(&invocation.command_id, &invocation.target_instance)
            .await?;

        Ok(RestoreCommandResult {
            console_url: console_url(
                &bucket,
                &self.runner.output_key_prefix(),
                &invocation.command_id,
                &invocation.target_instance,
            ),
            error_message: result.stderr,
            critical_error: result.is_critical,
            status: result.status,
        })
    }

    /// Invocation of the most recent restore of the current migration
    pub async fn last_invocation(&self) -> Result<Option<RemoteCommandInvocation>> {
        Ok(self
            .orchestrator
            .current_context()
            .await?
            .restore_invocation()
            .cloned())
    }

    async fn resolve_target(&self) -> Result<(String, String)> {
        let document = self.helper.db_restore_document().await.map_err(|e| {
            Error::DatabaseMigration(format!("unable to get outputs from migration stack: {}", e))
        })?;
        let instance_id = self.helper.migration_host_instance_id().await.map_err(|e| {
            Error::DatabaseMigration(format!("migration host is lost: {}", e))
        })?;
        Ok((document, instance_id))
    }

    async fn run_restore(&self, document: &str, instance_id: &str) -> Result<()> {
        let command_id = self
            .runner
            .run(document, instance_id, &CommandParameters::new())
            .await?;

        self.orchestrator
            .set_restore_invocation(RemoteCommandInvocation {
                document_name: document.to_string(),
                target_instance: instance_id.to_string(),
                command_id: command_id.clone(),
            })
            .await?;

        self.orchestrator
            .transition(MigrationStage::DataMigrationImportWait)
            .await?;

        let invocation = match self.runner.wait_for_success(&command_id, instance_id).await {
            Ok(invocation) => invocation,
            Err(Error::UnsuccessfulCommand { status, .. }) => {
                warn!("Restore command {} ended as {}", command_id, status);
                return Err(Error::DatabaseMigration(RESTORE_FAILURE_MESSAGE.to_string()));
            }
            Err(e) => return Err(e),
        };

        if let Some(pattern) = self
            .runner
            .classifier()
            .matched_pattern(invocation.stderr.as_deref())
        {
            debug!("Restore stderr matched critical pattern {:?}", pattern);
            return Err(Error::CriticalRemoteError(
                invocation.stderr.unwrap_or_default(),
            ));
        }

        self.orchestrator
            .transition(MigrationStage::Validate)
            .await?;
        info!("Database restore command {} completed", command_id);
        Ok(())
    }
}

fn console_url(bucket: &str, prefix: &str, command_id: &str, instance_id: &str) -> String {
    format!(
        "https://console.aws.amazon.com/s3/buckets/{}/{}/{}/{}/awsrunShellScript/{}/",
        bucket, prefix, command_id, instance_id, RESTORE_DOCUMENT_NAME
    )
}
