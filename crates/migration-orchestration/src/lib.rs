//! # Migration orchestration
//!
//! Drives a resumable on-premise to cloud migration through its stages.
//!
//! - [`Orchestrator`] owns the current migration and is the only writer of
//!   migration state
//! - [`deployment::DeploymentWatcher`] provisions a stack and polls it until
//!   it succeeds, fails or times out
//! - [`remote::RemoteCommandRunner`] runs documents on remote instances and
//!   classifies their stderr
//! - [`cancellation::CancellationCoordinator`] aborts in-flight jobs when
//!   migrations are reset
//! - [`MigrationEngine`] wires all of the above together
//!
//! ## Example
//!
//! ```rust
//! use migration_orchestration::{EventPublisher, Orchestrator};
//! use migration_state::{MemoryBackend, MigrationStage};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), migration_orchestration::Error> {
//! smol::block_on(async {
//!     let orchestrator = Orchestrator::new(
//!         Arc::new(MemoryBackend::new()),
//!         Arc::new(EventPublisher::new()),
//!     );
//!
//!     orchestrator.create_migration().await?;
//!     orchestrator.transition(MigrationStage::Authentication).await?;
//!     assert_eq!(orchestrator.current_stage().await?, MigrationStage::Authentication);
//!     Ok::<(), migration_orchestration::Error>(())
//! })
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod cancellation;
pub mod config;
pub mod deployment;
pub mod engine;
pub mod events;
pub mod mode;
pub mod orchestrator;
pub mod remote;
pub mod view;

pub use cancellation::{
    CancellableMigrationService, CancellationCoordinator, MigrationJobRunner,
    ScheduledMigrationJob,
};
pub use config::{DeploymentConfig, HelperOverrides, OrchestrationConfig, RemoteCommandConfig};
pub use deployment::{
    DeploymentCallbacks, DeploymentStatusRecorder, InstanceLocator, StackApi, StackParameters,
    application::ApplicationDeploymentService,
    helper::MigrationHelperDeploymentService,
    watcher::{DeploymentHandle, DeploymentOutcome, DeploymentWatcher},
};
pub use engine::{CloudApis, MigrationEngine};
pub use events::{EventPublisher, ListenerId, MigrationEvent, MigrationEventListener};
pub use mode::{MigrationMode, ModalStageWorker};
pub use orchestrator::Orchestrator;
pub use remote::{
    CommandInvocation, CommandParameters, CommandStatus, RemoteCommandApi,
    critical::{CRITICAL_ERROR_PATTERNS, CriticalErrorClassifier},
    fs_restore::{FileSystemDownloadStatus, FileSystemRestoreService},
    restore::{DatabaseRestoreService, RestoreCommandResult},
    runner::{CommandResult, RemoteCommandInvocation, RemoteCommandRunner},
    service::{ApplicationServiceController, RemoteServiceState, with_service_stopped},
};
pub use view::{ContextView, MigrationView};

use migration_state::{MigrationId, MigrationStage};

/// Error types for orchestration operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A stage precondition or transition was rejected
    #[error("{0}")]
    InvalidMigrationStage(String),

    /// A migration past `NOT_STARTED` already exists
    #[error("Found existing migration in Stage - `{0}`")]
    MigrationAlreadyExists(MigrationStage),

    /// A write scoped to a migration found it reset or replaced
    #[error("Migration {0} is no longer the current migration")]
    MigrationNotCurrent(MigrationId),

    /// Stack provisioning or its outputs failed
    #[error("Infrastructure deployment error: {0}")]
    InfrastructureDeployment(String),

    /// Database restore failed
    #[error("Database migration error: {0}")]
    DatabaseMigration(String),

    /// Filesystem copy failed
    #[error("Filesystem migration error: {0}")]
    FileSystemMigration(String),

    /// A command result was requested before any command ran
    #[error("Command not initialised: {0}")]
    CommandNotInitialised(String),

    /// The remote API refused to start a command
    #[error("Failed to launch command: {0}")]
    CommandLaunch(String),

    /// A remote command finished without succeeding
    #[error("Command {command_id} finished with status {status}")]
    UnsuccessfulCommand {
        /// Command identifier
        command_id: String,
        /// Last observed status
        status: CommandStatus,
    },

    /// Remote stderr matched a fatal connectivity pattern
    #[error("Critical remote error: {0}")]
    CriticalRemoteError(String),

    /// A collaborating cloud API failed
    #[error("Cloud provider error: {0}")]
    Provider(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Migration state errors
    #[error("Migration state error: {0}")]
    State(#[from] migration_state::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Rejected transition between two stages
    pub fn invalid_transition(from: MigrationStage, to: MigrationStage) -> Self {
        Self::InvalidMigrationStage(format!("Attempt to migrate from `{}` to `{}`", from, to))
    }

    /// The current stage is not the one an operation requires
    pub fn unexpected_stage(expected: MigrationStage, actual: MigrationStage) -> Self {
        Self::InvalidMigrationStage(format!(
            "wanted to be in stage {} but was in stage {}",
            expected, actual
        ))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
