//! Shared file download onto the migration helper instance
//!
//! The helper stack ships two documents: one that syncs the uploaded files
//! from the migration bucket onto the new shared file system, and one that
//! reports the state of that sync as JSON on stdout:
//!
//! ```json
//! {"finished": true, "exit_code": 0, "errors": []}
//! ```

use crate::{
    Error, Result,
    config::RemoteCommandConfig,
    deployment::helper::MigrationHelperDeploymentService,
    orchestrator::Orchestrator,
    remote::{CommandParameters, runner::RemoteCommandRunner},
};
use async_runtime_compat::runtime_utils::sleep;
use migration_state::MigrationStage;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// State of the file download as reported by the status document
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FileSystemDownloadStatus {
    /// The sync has stopped
    #[serde(default)]
    pub finished: bool,
    /// Exit code of the sync once it stopped
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Errors reported by the sync
    #[serde(default)]
    pub errors: Vec<String>,
}

impl FileSystemDownloadStatus {
    /// Parse the stdout of the status document
    pub fn parse(stdout: Option<&str>) -> Result<Self> {
        let stdout = stdout.map(str::trim).filter(|s| !s.is_empty()).ok_or_else(|| {
            Error::FileSystemMigration("download status command produced no output".to_string())
        })?;
        serde_json::from_str(stdout).map_err(|e| {
            Error::FileSystemMigration(format!("unable to read download status: {}", e))
        })
    }

    /// Stopped cleanly
    pub fn is_complete(&self) -> bool {
        self.finished && self.exit_code.unwrap_or(0) == 0 && self.errors.is_empty()
    }

    /// Stopped with an error
    pub fn has_failed(&self) -> bool {
        self.finished && !self.is_complete()
    }
}

/// Downloads the uploaded shared files onto the new file system
pub struct FileSystemRestoreService {
    orchestrator: Arc<Orchestrator>,
    helper: Arc<MigrationHelperDeploymentService>,
    runner: Arc<RemoteCommandRunner>,
    poll_interval: Duration,
    max_polls: u32,
}

impl FileSystemRestoreService {
    /// Create the service, polling as often as `config` allows
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        helper: Arc<MigrationHelperDeploymentService>,
        runner: Arc<RemoteCommandRunner>,
        config: &RemoteCommandConfig,
    ) -> Self {
        Self {
            orchestrator,
            helper,
            runner,
            poll_interval: config.poll_interval(),
            max_polls: config.max_attempts.max(1),
        }
    }

    /// Set the interval between status checks
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set how many status checks are made before giving up
    pub fn with_max_polls(mut self, max_polls: u32) -> Self {
        self.max_polls = max_polls.max(1);
        self
    }

    /// Download the shared files and wait for the sync to stop
    ///
    /// Requires `FS_MIGRATION_COPY_WAIT` and leaves the stage alone on
    /// success. Any failure once the download has been started moves the
    /// migration to `ERROR`.
    pub async fn restore_file_system(&self) -> Result<()> {
        self.orchestrator
            .assert_current_stage(MigrationStage::FsMigrationCopyWait)
            .await?;

        let result = self.download_and_wait().await;
        if let Err(e) = &result {
            error!("File system download failed: {}", e);
            if let Err(record_err) = self.orchestrator.error_from(e).await {
                error!("Failed to record migration error: {}", record_err);
            }
        }
        result
    }

    /// Start the download document on the helper instance
    pub async fn start_download(&self) -> Result<String> {
        let document = self.helper.fs_restore_document().await.map_err(|e| {
            Error::FileSystemMigration(format!("unable to get outputs from migration stack: {}", e))
        })?;
        let instance_id = self.migration_host().await?;

        let command_id = self
            .runner
            .run(&document, &instance_id, &CommandParameters::new())
            .await
            .map_err(|e| Error::FileSystemMigration(e.to_string()))?;
        info!(
            "Started file system download {} on migration host {}",
            command_id, instance_id
        );
        Ok(command_id)
    }

    /// Run the status document and read its report
    pub async fn download_status(&self) -> Result<FileSystemDownloadStatus> {
        let document = self.helper.fs_restore_status_document().await.map_err(|e| {
            Error::FileSystemMigration(format!("unable to get outputs from migration stack: {}", e))
        })?;
        let instance_id = self.migration_host().await?;

        let command_id = self
            .runner
            .run(&document, &instance_id, &CommandParameters::new())
            .await
            .map_err(|e| Error::FileSystemMigration(e.to_string()))?;
        let invocation = self
            .runner
            .wait_for_success(&command_id, &instance_id)
            .await
            .map_err(|e| {
                Error::FileSystemMigration(format!("unable to query download status: {}", e))
            })?;

        FileSystemDownloadStatus::parse(invocation.stdout.as_deref())
    }

    async fn download_and_wait(&self) -> Result<()> {
        self.start_download().await?;

        for poll in 1..=self.max_polls {
            let status = self.download_status().await?;
            if status.is_complete() {
                info!("File system download completed");
                return Ok(());
            }
            if status.has_failed() {
                return Err(Error::FileSystemMigration(format!(
                    "file system download failed with exit code {}: {}",
                    status.exit_code.unwrap_or_default(),
                    status.errors.join("; ")
                )));
            }

            debug!("File system download still running after check {}", poll);
            if poll < self.max_polls {
                sleep(self.poll_interval).await;
            }
        }

        Err(Error::FileSystemMigration(format!(
            "file system download did not finish after {} checks",
            self.max_polls
        )))
    }

    async fn migration_host(&self) -> Result<String> {
        self.helper
            .migration_host_instance_id()
            .await
            .map_err(|e| Error::FileSystemMigration(format!("migration host is lost: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let running = FileSystemDownloadStatus::parse(Some(r#"{"finished": false}"#)).unwrap();
        assert!(!running.is_complete());
        assert!(!running.has_failed());

        let done =
            FileSystemDownloadStatus::parse(Some(r#"{"finished": true, "exit_code": 0}"#)).unwrap();
        assert!(done.is_complete());

        let failed = FileSystemDownloadStatus::parse(Some(
            r#"{"finished": true, "exit_code": 1, "errors": ["access denied"]}"#,
        ))
        .unwrap();
        assert!(failed.has_failed());
        assert_eq!(failed.errors, vec!["access denied".to_string()]);
    }

    #[test]
    fn test_unreadable_status_is_a_file_system_error() {
        for stdout in [None, Some("   "), Some("sync: 40%")] {
            let err = FileSystemDownloadStatus::parse(stdout).unwrap_err();
            assert!(matches!(err, Error::FileSystemMigration(_)), "{stdout:?}");
        }
    }
}
