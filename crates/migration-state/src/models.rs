//! Persisted migration records

use crate::stage::MigrationStage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a migration record
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MigrationId(pub u64);

impl MigrationId {
    /// Big-endian key bytes, so that sled iterates in creation order
    pub fn to_key(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for MigrationId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A migration and the stage it is in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    /// Record identifier
    pub id: MigrationId,
    /// Current lifecycle stage
    pub stage: MigrationStage,
}

impl Migration {
    /// A fresh migration record
    pub fn new(id: MigrationId, stage: MigrationStage) -> Self {
        Self { id, stage }
    }

    /// Whether this migration still counts as the current one
    ///
    /// Only finished migrations are retired. A failed migration stays current
    /// until it is reset.
    pub fn is_current(&self) -> bool {
        self.stage != MigrationStage::Finished
    }
}

/// Last known status of a provisioned stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InfrastructureDeploymentState {
    /// No deployment has been requested
    #[default]
    NotDeploying,
    /// Stack creation is running
    CreateInProgress,
    /// Stack created
    CreateComplete,
    /// Stack creation failed
    CreateFailed,
    /// Stack deletion is running
    DeleteInProgress,
    /// Stack deletion failed
    DeleteFailed,
    /// Stack deleted
    DeleteComplete,
}

impl InfrastructureDeploymentState {
    /// Success-terminal
    pub fn is_success(&self) -> bool {
        *self == Self::CreateComplete
    }

    /// Still converging
    pub fn is_in_progress(&self) -> bool {
        *self == Self::CreateInProgress
    }

    /// Failure-terminal: any state that is neither success nor in progress
    pub fn is_failure(&self) -> bool {
        !self.is_success() && !self.is_in_progress()
    }
}

impl fmt::Display for InfrastructureDeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotDeploying => "NOT_DEPLOYING",
            Self::CreateInProgress => "CREATE_IN_PROGRESS",
            Self::CreateComplete => "CREATE_COMPLETE",
            Self::CreateFailed => "CREATE_FAILED",
            Self::DeleteInProgress => "DELETE_IN_PROGRESS",
            Self::DeleteFailed => "DELETE_FAILED",
            Self::DeleteComplete => "DELETE_COMPLETE",
        };
        f.write_str(name)
    }
}

/// Outputs of the migration helper stack needed by later stages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperStackOutputs {
    /// Remote command document that restores the database
    pub rds_restore_document: Option<String>,
    /// Remote command document that downloads shared files
    pub fs_restore_document: Option<String>,
    /// Remote command document that reports file download progress
    pub fs_restore_status_document: Option<String>,
    /// Auto-scaling group running the helper instance
    pub migration_stack_asg: Option<String>,
    /// Bucket holding migration artifacts
    pub migration_bucket_name: Option<String>,
}

impl HelperStackOutputs {
    /// True when no output has been recorded yet
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A remote command started on an instance
///
/// The command id is the durable handle for re-querying the invocation, so
/// it is kept in the context of the migration that started it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCommandInvocation {
    /// Document that was run
    pub document_name: String,
    /// Instance it runs on
    pub target_instance: String,
    /// Identifier for re-querying the invocation
    pub command_id: String,
}

/// Auxiliary state recorded alongside a migration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationContext {
    /// Owning migration
    pub migration_id: MigrationId,
    /// Unix seconds at creation
    pub start_epoch: i64,
    /// Unix seconds at finish or failure
    #[serde(default)]
    pub end_epoch: Option<i64>,
    /// Failure reason, at most 450 characters
    #[serde(default)]
    pub error_message: Option<String>,
    /// Last polled status of the stack being deployed
    #[serde(default)]
    pub deployment_state: InfrastructureDeploymentState,
    /// Name of the application stack
    #[serde(default)]
    pub application_deployment_id: Option<String>,
    /// Name of the migration helper stack
    #[serde(default)]
    pub helper_stack_deployment_id: Option<String>,
    /// URL the migrated application is served from
    #[serde(default)]
    pub service_url: Option<String>,
    /// Recorded outputs of the helper stack
    #[serde(default)]
    pub helper_outputs: HelperStackOutputs,
    /// Most recent database restore command
    #[serde(default)]
    pub restore_invocation: Option<RemoteCommandInvocation>,
}

impl MigrationContext {
    /// Empty context for a migration created at `start_epoch`
    pub fn new(migration_id: MigrationId, start_epoch: i64) -> Self {
        Self {
            migration_id,
            start_epoch,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_state_classification() {
        use InfrastructureDeploymentState::*;

        assert!(CreateComplete.is_success());
        assert!(CreateInProgress.is_in_progress());
        for state in [NotDeploying, CreateFailed, DeleteInProgress, DeleteFailed, DeleteComplete] {
            assert!(state.is_failure(), "{state} should be failure-terminal");
        }
        assert!(!CreateComplete.is_failure());
        assert!(!CreateInProgress.is_failure());
    }

    #[test]
    fn test_deployment_state_wire_names() {
        let json = serde_json::to_string(&InfrastructureDeploymentState::CreateInProgress).unwrap();
        assert_eq!(json, "\"CREATE_IN_PROGRESS\"");
        assert_eq!(
            InfrastructureDeploymentState::DeleteFailed.to_string(),
            "DELETE_FAILED"
        );
    }

    #[test]
    fn test_error_migration_is_still_current() {
        assert!(Migration::new(MigrationId(1), MigrationStage::Error).is_current());
        assert!(!Migration::new(MigrationId(1), MigrationStage::Finished).is_current());
    }

    #[test]
    fn test_context_tolerates_missing_optional_fields() {
        let ctx: MigrationContext =
            serde_json::from_str(r#"{"migration_id": 3, "start_epoch": 100}"#).unwrap();
        assert_eq!(ctx, MigrationContext::new(MigrationId(3), 100));
        assert!(ctx.helper_outputs.is_empty());
    }

    #[test]
    fn test_ids_sort_by_key_bytes() {
        assert!(MigrationId(2).to_key() < MigrationId(256).to_key());
    }
}
