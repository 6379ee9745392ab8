//! Migration lifecycle manager
//!
//! The orchestrator is the only component that changes migration state.
//! Every operation, including reads that may lazily create the first
//! migration, runs under one async write lock, so concurrent callers observe
//! a single serial order of transitions. Events are published while the lock
//! is held, which keeps their order identical to the order of the writes.

use crate::{
    Error, Result,
    deployment::DeploymentStatusRecorder,
    events::{EventPublisher, MigrationEvent},
    view::{ContextView, MigrationView},
};
use async_trait::async_trait;
use chrono::Utc;
use futures::lock::{Mutex, MutexGuard};
use migration_state::{
    HelperStackOutputs, InfrastructureDeploymentState, Migration, MigrationContext, MigrationId,
    MigrationStage, MigrationStore, RemoteCommandInvocation, StageRegistry,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Longest error message stored in a migration context, in characters
pub const MAX_ERROR_MESSAGE_CHARS: usize = 450;

/// Single writer of migration state
pub struct Orchestrator {
    store: Arc<dyn MigrationStore>,
    registry: StageRegistry,
    events: Arc<EventPublisher>,
    write_lock: Mutex<()>,
}

impl Orchestrator {
    /// Create an orchestrator over the standard stage table
    pub fn new(store: Arc<dyn MigrationStore>, events: Arc<EventPublisher>) -> Self {
        Self::with_registry(store, events, StageRegistry::standard())
    }

    /// Create an orchestrator over a custom stage table
    pub fn with_registry(
        store: Arc<dyn MigrationStore>,
        events: Arc<EventPublisher>,
        registry: StageRegistry,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            write_lock: Mutex::new(()),
        }
    }

    /// Publisher this orchestrator reports to
    pub fn events(&self) -> &Arc<EventPublisher> {
        &self.events
    }

    /// Stage table in use
    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// Return the current migration if it has not started, creating one if
    /// none exists
    pub async fn create_migration(&self) -> Result<MigrationView> {
        let _guard = self.lock().await;
        let migration = self.find_or_create_locked().await?;

        if migration.stage != MigrationStage::NotStarted {
            return Err(Error::MigrationAlreadyExists(migration.stage));
        }
        Ok(MigrationView::new(migration))
    }

    /// Stage of the current migration
    pub async fn current_stage(&self) -> Result<MigrationStage> {
        Ok(self.current_migration().await?.stage())
    }

    /// Snapshot of the current migration
    pub async fn current_migration(&self) -> Result<MigrationView> {
        let _guard = self.lock().await;
        Ok(MigrationView::new(self.find_or_create_locked().await?))
    }

    /// Snapshot of the current migration's context
    pub async fn current_context(&self) -> Result<ContextView> {
        let _guard = self.lock().await;
        let migration = self.find_or_create_locked().await?;
        Ok(ContextView::new(self.store.get_context(migration.id).await?))
    }

    /// Fail unless the current migration is in `expected`
    pub async fn assert_current_stage(&self, expected: MigrationStage) -> Result<()> {
        let actual = self.current_stage().await?;
        if actual != expected {
            return Err(Error::unexpected_stage(expected, actual));
        }
        Ok(())
    }

    /// Move the current migration to `to`
    ///
    /// Rejected transitions leave the stage unchanged, publish
    /// [`MigrationEvent::TransitionFailed`] and return
    /// [`Error::InvalidMigrationStage`].
    pub async fn transition(&self, to: MigrationStage) -> Result<()> {
        let _guard = self.lock().await;
        let mut migration = self.find_or_create_locked().await?;
        self.transition_locked(&mut migration, to).await
    }

    /// Move the current migration to the error stage
    ///
    /// Bypasses the stage table. The message is truncated to
    /// [`MAX_ERROR_MESSAGE_CHARS`] characters before it is stored.
    pub async fn error(&self, message: impl Into<String>) -> Result<()> {
        let message = truncate_message(&message.into());

        let _guard = self.lock().await;
        let migration = self.find_or_create_locked().await?;
        self.fail_locked(migration, message).await
    }

    /// [`Orchestrator::error`] for `migration_id` only
    ///
    /// Fails with [`Error::MigrationNotCurrent`], changing nothing, once that
    /// migration has been reset or replaced.
    pub async fn error_for(
        &self,
        migration_id: MigrationId,
        message: impl Into<String>,
    ) -> Result<()> {
        let message = truncate_message(&message.into());

        let _guard = self.lock().await;
        let migration = self.find_scoped_locked(migration_id).await?;
        self.fail_locked(migration, message).await
    }

    /// [`Orchestrator::error`] with the display form of `err`
    pub async fn error_from(&self, err: &(dyn std::error::Error + Send + Sync)) -> Result<()> {
        self.error(err.to_string()).await
    }

    /// [`Orchestrator::transition`] for `migration_id` only
    ///
    /// Fails with [`Error::MigrationNotCurrent`] once that migration has been
    /// reset or replaced.
    pub async fn transition_for(
        &self,
        migration_id: MigrationId,
        to: MigrationStage,
    ) -> Result<()> {
        let _guard = self.lock().await;
        let mut migration = self.find_scoped_locked(migration_id).await?;
        self.transition_locked(&mut migration, to).await
    }

    /// Whether `migration_id` is the current migration
    ///
    /// Never creates a migration.
    pub async fn is_current(&self, migration_id: MigrationId) -> Result<bool> {
        let _guard = self.lock().await;
        Ok(self.find_current_locked().await?.map(|m| m.id) == Some(migration_id))
    }

    /// Move the current migration to `FINISHED` and stamp its end time
    pub async fn finish(&self) -> Result<()> {
        let _guard = self.lock().await;
        let mut migration = self.find_or_create_locked().await?;
        self.transition_locked(&mut migration, MigrationStage::Finished)
            .await?;

        let mut context = self.store.get_context(migration.id).await?;
        let now = now_epoch();
        context.end_epoch = Some(now);
        self.store.save_context(&context).await?;

        info!("Migration {} finished", migration.id);
        self.events.publish(MigrationEvent::Completed {
            migration_id: migration.id,
            elapsed_secs: now - context.start_epoch,
        });

        Ok(())
    }

    /// Delete every migration and context, finished ones included
    ///
    /// Publishes one [`MigrationEvent::Reset`] per deleted migration.
    pub async fn delete_migrations(&self) -> Result<Vec<MigrationId>> {
        let _guard = self.lock().await;
        let deleted = self.store.delete_all().await?;

        let ids: Vec<MigrationId> = deleted.iter().map(|m| m.id).collect();
        for id in &ids {
            warn!("Deleted migration {}", id);
            self.events.publish(MigrationEvent::Reset { migration_id: *id });
        }

        Ok(ids)
    }

    /// Record the last polled stack status of a deployment for `migration_id`
    pub async fn record_deployment_state(
        &self,
        migration_id: MigrationId,
        state: InfrastructureDeploymentState,
    ) -> Result<()> {
        self.update_context_for(migration_id, |context| context.deployment_state = state)
            .await
    }

    /// Record the application stack name
    pub async fn set_application_deployment_id(&self, id: impl Into<String>) -> Result<()> {
        let id = id.into();
        self.update_context(|context| context.application_deployment_id = Some(id))
            .await
    }

    /// Record the migration helper stack name
    pub async fn set_helper_stack_deployment_id(&self, id: impl Into<String>) -> Result<()> {
        let id = id.into();
        self.update_context(|context| context.helper_stack_deployment_id = Some(id))
            .await
    }

    /// Record the URL of the migrated application for `migration_id`
    pub async fn set_service_url(
        &self,
        migration_id: MigrationId,
        url: Option<String>,
    ) -> Result<()> {
        self.update_context_for(migration_id, |context| context.service_url = url)
            .await
    }

    /// Record the migration helper stack outputs for `migration_id`
    pub async fn set_helper_outputs(
        &self,
        migration_id: MigrationId,
        outputs: HelperStackOutputs,
    ) -> Result<()> {
        self.update_context_for(migration_id, |context| context.helper_outputs = outputs)
            .await
    }

    /// Record the database restore command of the current migration
    pub async fn set_restore_invocation(&self, invocation: RemoteCommandInvocation) -> Result<()> {
        self.update_context(|context| context.restore_invocation = Some(invocation))
            .await
    }

    async fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    async fn update_context(&self, apply: impl FnOnce(&mut MigrationContext) + Send) -> Result<()> {
        let _guard = self.lock().await;
        let migration = self.find_or_create_locked().await?;
        let mut context = self.store.get_context(migration.id).await?;
        apply(&mut context);
        self.store.save_context(&context).await?;
        Ok(())
    }

    async fn update_context_for(
        &self,
        migration_id: MigrationId,
        apply: impl FnOnce(&mut MigrationContext) + Send,
    ) -> Result<()> {
        let _guard = self.lock().await;
        let migration = self.find_scoped_locked(migration_id).await?;
        let mut context = self.store.get_context(migration.id).await?;
        apply(&mut context);
        self.store.save_context(&context).await?;
        Ok(())
    }

    async fn fail_locked(&self, mut migration: Migration, message: String) -> Result<()> {
        let mut context = self.store.get_context(migration.id).await?;

        let failed_stage = migration.stage;
        let now = now_epoch();

        migration.stage = MigrationStage::Error;
        self.store.save_migration(&migration).await?;

        context.error_message = Some(message.clone());
        context.end_epoch = Some(now);
        self.store.save_context(&context).await?;

        error!(
            "Migration {} failed in stage {}: {}",
            migration.id, failed_stage, message
        );
        self.events.publish(MigrationEvent::Failed {
            migration_id: migration.id,
            failed_stage,
            reason: message,
            elapsed_secs: now - context.start_epoch,
        });

        Ok(())
    }

    async fn transition_locked(&self, migration: &mut Migration, to: MigrationStage) -> Result<()> {
        let from = migration.stage;

        if !self.registry.is_valid_transition(from, to) {
            warn!(
                "Rejected transition of migration {} from {} to {}",
                migration.id, from, to
            );
            self.events.publish(MigrationEvent::TransitionFailed {
                migration_id: migration.id,
                from,
                to,
            });
            return Err(Error::invalid_transition(from, to));
        }

        migration.stage = to;
        self.store.save_migration(migration).await?;

        info!("Migration {} transitioned from {} to {}", migration.id, from, to);
        self.events.publish(MigrationEvent::Transitioned {
            migration_id: migration.id,
            from,
            to,
        });

        Ok(())
    }

    /// Must be called with the write lock held
    async fn find_current_locked(&self) -> Result<Option<Migration>> {
        let mut current = self.store.find_current_migrations().await?;

        match current.len() {
            0 => Ok(None),
            1 => Ok(current.pop()),
            n => {
                error!("Expected one current migration, found {}", n);
                Err(migration_state::Error::InvalidState(format!(
                    "should only be 1 current migration, found {}",
                    n
                ))
                .into())
            }
        }
    }

    /// Must be called with the write lock held
    async fn find_or_create_locked(&self) -> Result<Migration> {
        if let Some(migration) = self.find_current_locked().await? {
            return Ok(migration);
        }

        let (migration, _) = self
            .store
            .create_migration(MigrationStage::NotStarted, now_epoch())
            .await?;
        debug!("Created migration {}", migration.id);
        self.events.publish(MigrationEvent::Created {
            migration_id: migration.id,
        });
        Ok(migration)
    }

    /// Must be called with the write lock held
    async fn find_scoped_locked(&self, migration_id: MigrationId) -> Result<Migration> {
        match self.find_current_locked().await? {
            Some(migration) if migration.id == migration_id => Ok(migration),
            _ => {
                debug!("Migration {} is no longer current", migration_id);
                Err(Error::MigrationNotCurrent(migration_id))
            }
        }
    }
}

#[async_trait]
impl DeploymentStatusRecorder for Orchestrator {
    async fn record_deployment_state(
        &self,
        migration_id: MigrationId,
        state: InfrastructureDeploymentState,
    ) -> Result<()> {
        Orchestrator::record_deployment_state(self, migration_id, state).await
    }
}

fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

fn truncate_message(message: &str) -> String {
    message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
}
