//! Engine facade wiring the migration subsystems together

use crate::{
    Result,
    cancellation::{
        CancellableMigrationService, CancellationCoordinator, MigrationJobRunner,
        ScheduledMigrationJob,
    },
    config::OrchestrationConfig,
    deployment::{
        InstanceLocator, StackApi, StackParameters,
        application::ApplicationDeploymentService,
        helper::MigrationHelperDeploymentService,
        watcher::{DeploymentHandle, DeploymentWatcher},
    },
    events::EventPublisher,
    mode::ModalStageWorker,
    orchestrator::Orchestrator,
    remote::{
        CommandParameters, RemoteCommandApi,
        fs_restore::FileSystemRestoreService,
        restore::{DatabaseRestoreService, RestoreCommandResult},
        runner::{CommandResult, RemoteCommandRunner},
        service::ApplicationServiceController,
    },
    view::MigrationView,
};
use async_runtime_compat::Spawner;
use migration_state::{InfrastructureDeploymentState, MigrationId, MigrationStage, MigrationStore};
use std::sync::Arc;
use tracing::info;

/// Cloud APIs the engine drives
#[derive(Clone)]
pub struct CloudApis {
    /// Stack provisioning
    pub stacks: Arc<dyn StackApi>,
    /// Remote command execution
    pub commands: Arc<dyn RemoteCommandApi>,
    /// Instance discovery
    pub instances: Arc<dyn InstanceLocator>,
}

/// A fully wired migration engine
pub struct MigrationEngine {
    config: OrchestrationConfig,
    events: Arc<EventPublisher>,
    orchestrator: Arc<Orchestrator>,
    application: ApplicationDeploymentService,
    helper: Arc<MigrationHelperDeploymentService>,
    runner: Arc<RemoteCommandRunner>,
    restore: DatabaseRestoreService,
    fs_restore: FileSystemRestoreService,
    watcher: Arc<DeploymentWatcher>,
    worker: ModalStageWorker,
    jobs: Vec<Arc<ScheduledMigrationJob>>,
    coordinator: Arc<CancellationCoordinator>,
}

impl MigrationEngine {
    /// Initialise `store` and wire every subsystem
    ///
    /// The cancellation coordinator is attached to the event publisher on
    /// return and stays attached until [`MigrationEngine::shutdown`].
    pub async fn start(
        config: OrchestrationConfig,
        store: Arc<dyn MigrationStore>,
        apis: CloudApis,
        spawner: Arc<dyn Spawner>,
    ) -> Result<Self> {
        config.validate()?;
        store.init().await?;

        let events = Arc::new(EventPublisher::new());
        let orchestrator = Arc::new(Orchestrator::new(store, events.clone()));

        let watcher = Arc::new(DeploymentWatcher::from_config(
            apis.stacks.clone(),
            orchestrator.clone(),
            spawner.clone(),
            &config.deployment,
        ));
        let helper = Arc::new(MigrationHelperDeploymentService::new(
            orchestrator.clone(),
            watcher.clone(),
            apis.instances.clone(),
            &config.deployment,
            config.helper.clone(),
        ));
        let application = ApplicationDeploymentService::new(
            orchestrator.clone(),
            watcher.clone(),
            helper.clone(),
            &config.deployment,
        );

        let runner = Arc::new(RemoteCommandRunner::from_config(
            apis.commands.clone(),
            &config.remote,
        ));
        let controller = Arc::new(ApplicationServiceController::new(
            runner.clone(),
            orchestrator.clone(),
            apis.instances.clone(),
            config.remote.service_name.clone(),
            config.remote.shell_document.clone(),
        ));
        let restore = DatabaseRestoreService::new(
            orchestrator.clone(),
            helper.clone(),
            runner.clone(),
            controller,
        );
        let fs_restore = FileSystemRestoreService::new(
            orchestrator.clone(),
            helper.clone(),
            runner.clone(),
            &config.remote,
        );

        let job_runner = Arc::new(MigrationJobRunner::new(spawner));
        let jobs: Vec<Arc<ScheduledMigrationJob>> = [
            ScheduledMigrationJob::FS_COPY,
            ScheduledMigrationJob::DATABASE_EXPORT,
            ScheduledMigrationJob::FINAL_SYNC,
        ]
        .into_iter()
        .map(|job| Arc::new(ScheduledMigrationJob::new(job, job_runner.clone())))
        .collect();
        let mut services: Vec<Arc<dyn CancellableMigrationService>> = jobs
            .iter()
            .map(|job| job.clone() as Arc<dyn CancellableMigrationService>)
            .collect();
        services.push(watcher.clone() as Arc<dyn CancellableMigrationService>);

        let coordinator = Arc::new(CancellationCoordinator::new(services));
        coordinator.attach(&events);

        let worker = ModalStageWorker::new(orchestrator.clone(), config.mode);

        info!("Migration engine started in {} mode", config.mode);
        Ok(Self {
            config,
            events,
            orchestrator,
            application,
            helper,
            runner,
            restore,
            fs_restore,
            watcher,
            worker,
            jobs,
            coordinator,
        })
    }

    /// Configuration the engine was started with
    pub fn config(&self) -> &OrchestrationConfig {
        &self.config
    }

    /// Publisher of migration events
    pub fn events(&self) -> &Arc<EventPublisher> {
        &self.events
    }

    /// The single writer of migration state
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Helper stack service, for resolving its outputs
    pub fn helper(&self) -> &Arc<MigrationHelperDeploymentService> {
        &self.helper
    }

    /// Watcher of the stacks being deployed
    pub fn watcher(&self) -> &Arc<DeploymentWatcher> {
        &self.watcher
    }

    /// Scheduled job of the given kind, see [`ScheduledMigrationJob`]
    pub fn scheduled_job(&self, job: &str) -> Option<&Arc<ScheduledMigrationJob>> {
        self.jobs.iter().find(|scheduled| scheduled.job() == job)
    }

    /// See [`Orchestrator::create_migration`]
    pub async fn create_migration(&self) -> Result<MigrationView> {
        self.orchestrator.create_migration().await
    }

    /// See [`Orchestrator::current_stage`]
    pub async fn current_stage(&self) -> Result<MigrationStage> {
        self.orchestrator.current_stage().await
    }

    /// See [`Orchestrator::transition`]
    pub async fn transition(&self, to: MigrationStage) -> Result<()> {
        self.orchestrator.transition(to).await
    }

    /// See [`Orchestrator::error`]
    pub async fn error(&self, message: impl Into<String>) -> Result<()> {
        self.orchestrator.error(message).await
    }

    /// Deploy the application stack, followed by the migration helper stack
    pub async fn deploy_infrastructure(
        &self,
        stack_name: &str,
        params: StackParameters,
    ) -> Result<DeploymentHandle> {
        self.application.deploy_application(stack_name, params).await
    }

    /// Last recorded status of the stack being deployed
    pub async fn deployment_status(&self) -> Result<InfrastructureDeploymentState> {
        self.application.deployment_status().await
    }

    /// Start `document` on `target`, returning the command id
    pub async fn run_remote_command(
        &self,
        document: &str,
        target: &str,
        params: &CommandParameters,
    ) -> Result<String> {
        self.runner.run(document, target, params).await
    }

    /// Classified result of any command started on `target`
    pub async fn fetch_command_result(
        &self,
        command_id: &str,
        target: &str,
    ) -> Result<CommandResult> {
        self.runner.fetch_result(command_id, target).await
    }

    /// Status and output location of the last database restore
    ///
    /// The invocation is read from the migration context, so this still
    /// works after the engine is restarted over the same store.
    pub async fn fetch_restore_result(&self) -> Result<RestoreCommandResult> {
        self.restore.fetch_command_result().await
    }

    /// Restore the database from `DATA_MIGRATION_IMPORT`, as the configured
    /// mode allows
    ///
    /// Passthrough mode only moves the migration on to
    /// `DATA_MIGRATION_IMPORT_WAIT`. Returns whether the restore ran.
    pub async fn restore_database(&self) -> Result<bool> {
        self.worker
            .run_according_to_mode(
                || self.restore.restore_database(),
                MigrationStage::DataMigrationImport,
                MigrationStage::DataMigrationImportWait,
            )
            .await
    }

    /// Download the shared files from `FS_MIGRATION_COPY_WAIT`, as the
    /// configured mode allows
    ///
    /// Passthrough mode only moves the migration on to `OFFLINE_WARNING`.
    pub async fn restore_file_system(&self) -> Result<bool> {
        self.worker
            .run_according_to_mode(
                || self.fs_restore.restore_file_system(),
                MigrationStage::FsMigrationCopyWait,
                MigrationStage::OfflineWarning,
            )
            .await
    }

    /// Delete every migration, unschedule their jobs and stop watching
    /// their deployments
    pub async fn delete_migrations(&self) -> Result<Vec<MigrationId>> {
        self.orchestrator.delete_migrations().await
    }

    /// Stop reacting to resets
    pub fn shutdown(&self) {
        self.coordinator.detach(&self.events);
        info!("Migration engine shut down");
    }
}
