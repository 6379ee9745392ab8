//! Sled database backend for migration state

use super::MigrationStore;
use crate::{
    MigrationStage,
    error::{Error, Result},
    models::*,
};
use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, error, info};

/// Sled-based migration backend
pub struct SledBackend {
    /// Database instance
    db: sled::Db,
    /// Migrations tree, keyed by big-endian id
    migrations: sled::Tree,
    /// Contexts tree, keyed like `migrations`
    contexts: sled::Tree,
}

impl SledBackend {
    /// Open or create a sled backend at `path`
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening sled database at {:?}", path);
        let db = sled::open(path)?;
        Self::with_db(db)
    }

    /// Create an in-memory sled backend (for testing)
    pub async fn in_memory() -> Result<Self> {
        info!("Creating in-memory sled database");
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db)
    }

    fn with_db(db: sled::Db) -> Result<Self> {
        let migrations = db.open_tree("migrations")?;
        let contexts = db.open_tree("contexts")?;

        Ok(Self {
            db,
            migrations,
            contexts,
        })
    }

    fn read_migration(&self, id: MigrationId) -> Result<Option<Migration>> {
        match self.migrations.get(id.to_key())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl MigrationStore for SledBackend {
    async fn init(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    async fn list_migrations(&self) -> Result<Vec<Migration>> {
        debug!("Listing all migrations");

        let mut migrations = Vec::new();
        for result in self.migrations.iter() {
            let (_, value) = result?;
            migrations.push(serde_json::from_slice(&value)?);
        }

        Ok(migrations)
    }

    async fn get_migration(&self, id: MigrationId) -> Result<Option<Migration>> {
        debug!("Getting migration: {}", id);
        self.read_migration(id)
    }

    async fn create_migration(
        &self,
        stage: MigrationStage,
        start_epoch: i64,
    ) -> Result<(Migration, MigrationContext)> {
        // generate_id starts at zero and is monotonic across restarts
        let id = MigrationId(self.db.generate_id()? + 1);
        let migration = Migration::new(id, stage);
        let context = MigrationContext::new(id, start_epoch);

        debug!("Creating migration {} in stage {}", id, stage);
        self.contexts
            .insert(id.to_key(), serde_json::to_vec(&context)?)?;
        self.migrations
            .insert(id.to_key(), serde_json::to_vec(&migration)?)?;
        self.db.flush_async().await?;

        Ok((migration, context))
    }

    async fn save_migration(&self, migration: &Migration) -> Result<()> {
        debug!("Storing migration {} in stage {}", migration.id, migration.stage);

        if !self.migrations.contains_key(migration.id.to_key())? {
            return Err(Error::MigrationNotFound(migration.id));
        }

        self.migrations
            .insert(migration.id.to_key(), serde_json::to_vec(migration)?)?;
        self.migrations.flush_async().await?;

        Ok(())
    }

    async fn get_context(&self, id: MigrationId) -> Result<MigrationContext> {
        debug!("Getting context for migration: {}", id);

        match self.contexts.get(id.to_key())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(Error::ContextNotFound(id)),
        }
    }

    async fn save_context(&self, context: &MigrationContext) -> Result<()> {
        debug!("Storing context for migration: {}", context.migration_id);

        if !self.migrations.contains_key(context.migration_id.to_key())? {
            return Err(Error::MigrationNotFound(context.migration_id));
        }

        self.contexts
            .insert(context.migration_id.to_key(), serde_json::to_vec(context)?)?;
        self.contexts.flush_async().await?;

        Ok(())
    }

    async fn delete_all(&self) -> Result<Vec<Migration>> {
        let deleted = self.list_migrations().await?;
        info!("Deleting {} migration(s)", deleted.len());

        self.migrations.clear()?;
        self.contexts.clear()?;
        self.db.flush_async().await?;

        Ok(deleted)
    }
}

impl Drop for SledBackend {
    fn drop(&mut self) {
        if let Err(e) = self.db.flush() {
            error!("Failed to flush database on drop: {}", e);
        }
    }
}
