//! Tokio runtime spawner implementation

use crate::{BoxTask, Spawner};

/// Spawner for the Tokio runtime
///
/// Must be used from within a tokio runtime context.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

impl Spawner for TokioSpawner {
    fn spawn(&self, future: BoxTask) {
        // JoinHandle detaches when dropped
        tokio::spawn(future);
    }
}
