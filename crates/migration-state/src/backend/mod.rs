//! Migration storage backends

pub mod memory;
pub mod sled;

use crate::{MigrationStage, error::Result, models::*};
use async_trait::async_trait;

/// Trait for migration storage backends
///
/// Backends only store records. Stage validation and the single current
/// migration rule are enforced by the caller holding the write lock.
#[async_trait]
pub trait MigrationStore: Send + Sync {
    /// Initialize the backend
    async fn init(&self) -> Result<()>;

    /// All migrations that have not finished, oldest first
    async fn find_current_migrations(&self) -> Result<Vec<Migration>> {
        Ok(self
            .list_migrations()
            .await?
            .into_iter()
            .filter(Migration::is_current)
            .collect())
    }

    /// All migrations, oldest first
    async fn list_migrations(&self) -> Result<Vec<Migration>>;

    /// Get a migration by id
    async fn get_migration(&self, id: MigrationId) -> Result<Option<Migration>>;

    /// Allocate a migration in `stage` together with its empty context
    async fn create_migration(
        &self,
        stage: MigrationStage,
        start_epoch: i64,
    ) -> Result<(Migration, MigrationContext)>;

    /// Overwrite an existing migration record
    async fn save_migration(&self, migration: &Migration) -> Result<()>;

    /// Get the context of a migration
    async fn get_context(&self, id: MigrationId) -> Result<MigrationContext>;

    /// Overwrite the context of an existing migration
    async fn save_context(&self, context: &MigrationContext) -> Result<()>;

    /// Delete every migration and context, returning the deleted migrations
    async fn delete_all(&self) -> Result<Vec<Migration>>;
}
