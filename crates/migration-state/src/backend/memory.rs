//! In-memory backend for migration state

use super::MigrationStore;
use crate::{
    MigrationStage,
    error::{Error, Result},
    models::*,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Default)]
struct Records {
    migrations: BTreeMap<MigrationId, Migration>,
    contexts: BTreeMap<MigrationId, MigrationContext>,
}

/// In-memory migration backend
#[derive(Debug)]
pub struct MemoryBackend {
    records: RwLock<Records>,
    next_id: AtomicU64,
}

impl MemoryBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Records::default()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MigrationStore for MemoryBackend {
    async fn init(&self) -> Result<()> {
        // No initialization needed for in-memory backend
        Ok(())
    }

    async fn list_migrations(&self) -> Result<Vec<Migration>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records.migrations.values().cloned().collect())
    }

    async fn get_migration(&self, id: MigrationId) -> Result<Option<Migration>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records.migrations.get(&id).cloned())
    }

    async fn create_migration(
        &self,
        stage: MigrationStage,
        start_epoch: i64,
    ) -> Result<(Migration, MigrationContext)> {
        let id = MigrationId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let migration = Migration::new(id, stage);
        let context = MigrationContext::new(id, start_epoch);

        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.migrations.insert(id, migration.clone());
        records.contexts.insert(id, context.clone());

        Ok((migration, context))
    }

    async fn save_migration(&self, migration: &Migration) -> Result<()> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        match records.migrations.get_mut(&migration.id) {
            Some(slot) => {
                *slot = migration.clone();
                Ok(())
            }
            None => Err(Error::MigrationNotFound(migration.id)),
        }
    }

    async fn get_context(&self, id: MigrationId) -> Result<MigrationContext> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records
            .contexts
            .get(&id)
            .cloned()
            .ok_or(Error::ContextNotFound(id))
    }

    async fn save_context(&self, context: &MigrationContext) -> Result<()> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if !records.migrations.contains_key(&context.migration_id) {
            return Err(Error::MigrationNotFound(context.migration_id));
        }
        records.contexts.insert(context.migration_id, context.clone());
        Ok(())
    }

    async fn delete_all(&self) -> Result<Vec<Migration>> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let deleted = std::mem::take(&mut records.migrations);
        records.contexts.clear();
        Ok(deleted.into_values().collect())
    }
}
