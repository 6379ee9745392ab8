//! Durable state for on-premise to cloud migrations
//!
//! This crate owns the pieces of the migration engine that must survive a
//! restart of the controlling process:
//!
//! - the stage state machine, expressed as a static predecessor table
//!   ([`StageRegistry`])
//! - the persisted record shapes ([`Migration`], [`MigrationContext`])
//! - the [`MigrationStore`] persistence boundary with an in-memory and a
//!   sled-backed implementation
//!
//! # Example
//!
//! ```
//! use migration_state::{MigrationStage, StageRegistry};
//!
//! let registry = StageRegistry::standard();
//! assert!(registry.is_valid_transition(MigrationStage::NotStarted, MigrationStage::Authentication));
//! assert!(!registry.is_valid_transition(MigrationStage::NotStarted, MigrationStage::ProvisionApplication));
//! assert!(registry.is_valid_transition(MigrationStage::Validate, MigrationStage::Error));
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod error;
pub mod models;
pub mod stage;

pub use backend::{MigrationStore, memory::MemoryBackend, sled::SledBackend};
pub use error::{Error, Result};
pub use models::*;
pub use stage::{MigrationStage, STAGE_DEFINITIONS, StageDefinition, StageRegistry};

/// Re-export key types for convenience
pub mod prelude {
    pub use crate::{
        Error, HelperStackOutputs, InfrastructureDeploymentState, MemoryBackend, Migration,
        MigrationContext, MigrationId, MigrationStage, MigrationStore, Result, SledBackend,
        StageRegistry,
    };
}
