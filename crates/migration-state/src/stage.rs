//! Migration stages and the transition table between them
//!
//! Every stage declares at most one required predecessor. A transition
//! `from -> to` is valid when `to` declares no predecessor, or when its
//! declared predecessor is `from`. The table is plain data so that adding a
//! stage is a new row, not a new branch at each call site.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// All stages of an on-premise to cloud migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStage {
    /// Migration record exists but nothing has started
    NotStarted,
    /// Cloud credentials are being provided
    Authentication,
    /// Application stack deployment requested
    ProvisionApplication,
    /// Waiting for the application stack to deploy
    ProvisionApplicationWait,
    /// Migration helper stack deployment requested
    ProvisionMigrationStack,
    /// Waiting for the migration helper stack to deploy
    ProvisionMigrationStackWait,
    /// Shared files are being copied
    FsMigrationCopy,
    /// Waiting for the file copy to finish
    FsMigrationCopyWait,
    /// User is warned the application is about to go offline
    OfflineWarning,
    /// Database export requested
    DbMigrationExport,
    /// Waiting for the database export
    DbMigrationExportWait,
    /// Database artifact upload requested
    DbMigrationUpload,
    /// Waiting for the database artifact upload
    DbMigrationUploadWait,
    /// Restore of the uploaded data into the cloud replica requested
    DataMigrationImport,
    /// Waiting for the restore to complete
    DataMigrationImportWait,
    /// Migrated instance is being validated
    Validate,
    /// Traffic is being cut over to the cloud replica
    Cutover,
    /// Migration completed (terminal)
    Finished,
    /// Migration failed (terminal)
    Error,
}

impl MigrationStage {
    /// Whether no further progress is expected from this stage
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }

    /// Whether this stage belongs to the database export/upload phase
    pub fn is_db_phase(&self) -> bool {
        matches!(
            self,
            Self::DbMigrationExport
                | Self::DbMigrationExportWait
                | Self::DbMigrationUpload
                | Self::DbMigrationUploadWait
        )
    }

    /// Stable lower-case name, identical to the serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Authentication => "authentication",
            Self::ProvisionApplication => "provision_application",
            Self::ProvisionApplicationWait => "provision_application_wait",
            Self::ProvisionMigrationStack => "provision_migration_stack",
            Self::ProvisionMigrationStackWait => "provision_migration_stack_wait",
            Self::FsMigrationCopy => "fs_migration_copy",
            Self::FsMigrationCopyWait => "fs_migration_copy_wait",
            Self::OfflineWarning => "offline_warning",
            Self::DbMigrationExport => "db_migration_export",
            Self::DbMigrationExportWait => "db_migration_export_wait",
            Self::DbMigrationUpload => "db_migration_upload",
            Self::DbMigrationUploadWait => "db_migration_upload_wait",
            Self::DataMigrationImport => "data_migration_import",
            Self::DataMigrationImportWait => "data_migration_import_wait",
            Self::Validate => "validate",
            Self::Cutover => "cutover",
            Self::Finished => "finished",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MigrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage together with the stage it must be entered from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDefinition {
    /// The stage being defined
    pub name: MigrationStage,
    /// Stage the migration must be in to enter `name`, if constrained
    pub required_predecessor: Option<MigrationStage>,
}

const fn after(name: MigrationStage, predecessor: MigrationStage) -> StageDefinition {
    StageDefinition {
        name,
        required_predecessor: Some(predecessor),
    }
}

const fn unconstrained(name: MigrationStage) -> StageDefinition {
    StageDefinition {
        name,
        required_predecessor: None,
    }
}

/// The standard migration stage table, in lifecycle order
pub const STAGE_DEFINITIONS: &[StageDefinition] = {
    use MigrationStage::*;
    &[
        unconstrained(NotStarted),
        after(Authentication, NotStarted),
        after(ProvisionApplication, Authentication),
        after(ProvisionApplicationWait, ProvisionApplication),
        after(ProvisionMigrationStack, ProvisionApplicationWait),
        after(ProvisionMigrationStackWait, ProvisionMigrationStack),
        after(FsMigrationCopy, ProvisionMigrationStackWait),
        after(FsMigrationCopyWait, FsMigrationCopy),
        after(OfflineWarning, FsMigrationCopyWait),
        after(DbMigrationExport, OfflineWarning),
        after(DbMigrationExportWait, DbMigrationExport),
        after(DbMigrationUpload, DbMigrationExportWait),
        after(DbMigrationUploadWait, DbMigrationUpload),
        after(DataMigrationImport, DbMigrationUploadWait),
        after(DataMigrationImportWait, DataMigrationImport),
        after(Validate, DataMigrationImportWait),
        after(Cutover, Validate),
        after(Finished, Cutover),
        unconstrained(Error),
    ]
};

/// Lookup structure over a stage definition table
#[derive(Debug, Clone)]
pub struct StageRegistry {
    definitions: Vec<StageDefinition>,
    predecessors: HashMap<MigrationStage, Option<MigrationStage>>,
}

impl StageRegistry {
    /// Registry over [`STAGE_DEFINITIONS`]
    pub fn standard() -> Self {
        Self::from_definitions(STAGE_DEFINITIONS)
    }

    /// Registry over a custom table
    ///
    /// A stage listed twice keeps its last definition.
    pub fn from_definitions(definitions: &[StageDefinition]) -> Self {
        let predecessors = definitions
            .iter()
            .map(|d| (d.name, d.required_predecessor))
            .collect();

        Self {
            definitions: definitions.to_vec(),
            predecessors,
        }
    }

    /// Whether a migration in `from` may move to `to`
    ///
    /// Stages missing from the table are never valid targets.
    pub fn is_valid_transition(&self, from: MigrationStage, to: MigrationStage) -> bool {
        match self.predecessors.get(&to) {
            Some(None) => true,
            Some(Some(required)) => *required == from,
            None => false,
        }
    }

    /// The declared predecessor of `stage`
    pub fn required_predecessor(&self, stage: MigrationStage) -> Option<MigrationStage> {
        self.predecessors.get(&stage).copied().flatten()
    }

    /// Stages whose declared predecessor is `stage`
    pub fn successors(&self, stage: MigrationStage) -> Vec<MigrationStage> {
        self.definitions
            .iter()
            .filter(|d| d.required_predecessor == Some(stage))
            .map(|d| d.name)
            .collect()
    }

    /// All definitions in table order
    pub fn definitions(&self) -> &[StageDefinition] {
        &self.definitions
    }

    /// All declared `(predecessor, stage)` edges
    pub fn declared_edges(&self) -> Vec<(MigrationStage, MigrationStage)> {
        self.definitions
            .iter()
            .filter_map(|d| d.required_predecessor.map(|p| (p, d.name)))
            .collect()
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use MigrationStage::*;

    fn all_stages() -> Vec<MigrationStage> {
        STAGE_DEFINITIONS.iter().map(|d| d.name).collect()
    }

    #[test]
    fn test_every_declared_edge_is_valid() {
        let registry = StageRegistry::standard();
        for (from, to) in registry.declared_edges() {
            assert!(registry.is_valid_transition(from, to), "{from} -> {to}");
        }
    }

    #[test]
    fn test_undeclared_edges_are_rejected() {
        let registry = StageRegistry::standard();
        for to in all_stages() {
            let Some(required) = registry.required_predecessor(to) else {
                continue;
            };
            for from in all_stages().into_iter().filter(|s| *s != required) {
                assert!(
                    !registry.is_valid_transition(from, to),
                    "{from} -> {to} should be rejected"
                );
            }
        }
    }

    #[test]
    fn test_error_is_reachable_from_every_stage() {
        let registry = StageRegistry::standard();
        for from in all_stages() {
            assert!(registry.is_valid_transition(from, Error));
        }
    }

    #[test]
    fn test_cannot_skip_authentication() {
        let registry = StageRegistry::standard();
        assert!(registry.is_valid_transition(NotStarted, Authentication));
        assert!(registry.is_valid_transition(Authentication, ProvisionApplication));
        assert!(!registry.is_valid_transition(NotStarted, ProvisionApplication));
    }

    #[test]
    fn test_table_is_a_single_chain() {
        let registry = StageRegistry::standard();
        let mut stage = NotStarted;
        let mut visited = vec![stage];
        while let [next] = registry.successors(stage).as_slice() {
            stage = *next;
            visited.push(stage);
        }
        assert_eq!(stage, Finished);
        assert_eq!(visited.len(), STAGE_DEFINITIONS.len() - 1);
    }

    #[test]
    fn test_stage_classification() {
        assert!(Finished.is_terminal());
        assert!(Error.is_terminal());
        assert!(!Cutover.is_terminal());
        assert!(DbMigrationUploadWait.is_db_phase());
        assert!(!DataMigrationImport.is_db_phase());
    }

    #[test]
    fn test_stage_names_match_serde() {
        for stage in all_stages() {
            let json = serde_json::to_string(&stage).unwrap();
            assert_eq!(json, format!("\"{}\"", stage));
        }
    }

    #[test]
    fn test_custom_table_rows_extend_the_graph() {
        let mut rows = STAGE_DEFINITIONS.to_vec();
        // Allow validation to be re-run straight after a restore
        rows.push(StageDefinition {
            name: Validate,
            required_predecessor: Some(DataMigrationImport),
        });
        let registry = StageRegistry::from_definitions(&rows);
        assert!(registry.is_valid_transition(DataMigrationImport, Validate));
        assert!(!registry.is_valid_transition(DataMigrationImportWait, Validate));
    }
}
