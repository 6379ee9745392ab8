//! Stage operations gated by the configured migration mode

use crate::{Error, Result, orchestrator::Orchestrator};
use migration_state::MigrationStage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How stage operations are run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationMode {
    /// Run an operation only from its expected stage
    #[default]
    Default,
    /// Skip operations and move straight to their target stage
    Passthrough,
    /// Run operations without checking the current stage
    NoVerify,
}

impl fmt::Display for MigrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::Passthrough => f.write_str("passthrough"),
            Self::NoVerify => f.write_str("no-verify"),
        }
    }
}

/// Runs stage operations according to a [`MigrationMode`]
pub struct ModalStageWorker {
    orchestrator: Arc<Orchestrator>,
    mode: MigrationMode,
}

impl ModalStageWorker {
    /// Create a worker
    pub fn new(orchestrator: Arc<Orchestrator>, mode: MigrationMode) -> Self {
        Self { orchestrator, mode }
    }

    /// Configured mode
    pub fn mode(&self) -> MigrationMode {
        self.mode
    }

    /// Run `operation` as the mode dictates
    ///
    /// In default mode the current stage must be `expected`. In passthrough
    /// mode the operation is skipped and the migration is moved to
    /// `passthrough`; a rejected move is logged, not returned. Returns
    /// whether the operation ran.
    pub async fn run_according_to_mode<F, Fut>(
        &self,
        operation: F,
        expected: MigrationStage,
        passthrough: MigrationStage,
    ) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        match self.mode {
            MigrationMode::Default => {
                let current = self.orchestrator.current_stage().await?;
                if current != expected {
                    return Err(Error::unexpected_stage(expected, current));
                }
                operation().await?;
                Ok(true)
            }
            MigrationMode::Passthrough => {
                info!("Passthrough mode, moving to {} without running", passthrough);
                if let Err(e) = self.orchestrator.transition(passthrough).await {
                    warn!("Passthrough transition to {} rejected: {}", passthrough, e);
                }
                Ok(false)
            }
            MigrationMode::NoVerify => {
                debug!("No-verify mode, running without a stage check");
                operation().await?;
                Ok(true)
            }
        }
    }
}
