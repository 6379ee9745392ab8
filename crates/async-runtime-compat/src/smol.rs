//! Smol runtime spawner implementation

use crate::{BoxTask, Spawner};

/// Spawner for the Smol runtime
///
/// Tasks go to smol's global executor, so they keep running after the
/// spawning future returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmolSpawner;

impl Spawner for SmolSpawner {
    fn spawn(&self, future: BoxTask) {
        smol::spawn(future).detach();
    }
}
