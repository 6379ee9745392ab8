//! Fan-out of migration resets to background jobs
//!
//! Subsystems that run long jobs for a migration implement
//! [`CancellableMigrationService`]. The [`CancellationCoordinator`] listens
//! for [`MigrationEvent::Reset`] and asks every one of them to drop the
//! deleted migration's work.

use crate::events::{EventPublisher, ListenerId, MigrationEvent, MigrationEventListener};
use async_runtime_compat::{BoxTask, Spawner, TaskHandle};
use migration_state::MigrationId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// A subsystem holding per-migration background work
pub trait CancellableMigrationService: Send + Sync {
    /// Stop any work scheduled for `migration_id`
    ///
    /// Must not block and must tolerate being called when nothing is
    /// scheduled.
    fn unschedule_migration(&self, migration_id: MigrationId);
}

/// Forwards resets to a fixed set of services
pub struct CancellationCoordinator {
    services: Vec<Arc<dyn CancellableMigrationService>>,
    registration: Mutex<Option<ListenerId>>,
}

impl CancellationCoordinator {
    /// Create a coordinator over `services`
    pub fn new(services: Vec<Arc<dyn CancellableMigrationService>>) -> Self {
        Self {
            services,
            registration: Mutex::new(None),
        }
    }

    /// Unschedule `migration_id` on every service
    pub fn on_reset(&self, migration_id: MigrationId) {
        info!(
            "Unscheduling migration {} on {} services",
            migration_id,
            self.services.len()
        );
        for service in &self.services {
            service.unschedule_migration(migration_id);
        }
    }

    /// Start listening for resets on `publisher`
    ///
    /// Attaching an already attached coordinator does nothing.
    pub fn attach(self: &Arc<Self>, publisher: &EventPublisher) {
        let mut registration = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if registration.is_some() {
            debug!("Cancellation coordinator already attached");
            return;
        }
        *registration = Some(publisher.register(self.clone()));
    }

    /// Stop listening on `publisher`
    pub fn detach(&self, publisher: &EventPublisher) {
        let registration = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = registration {
            publisher.unregister(id);
            debug!("Cancellation coordinator detached");
        }
    }

    /// Whether the coordinator is currently registered
    pub fn is_attached(&self) -> bool {
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl MigrationEventListener for CancellationCoordinator {
    fn on_event(&self, event: &MigrationEvent) {
        if let MigrationEvent::Reset { migration_id } = event {
            self.on_reset(*migration_id);
        }
    }
}

struct RunningJob {
    generation: u64,
    handle: TaskHandle,
}

/// Runs abortable background jobs keyed by job and migration
pub struct MigrationJobRunner {
    spawner: Arc<dyn Spawner>,
    jobs: Arc<Mutex<HashMap<String, RunningJob>>>,
    next_generation: AtomicU64,
}

impl MigrationJobRunner {
    /// Create a runner spawning on `spawner`
    pub fn new(spawner: Arc<dyn Spawner>) -> Self {
        Self {
            spawner,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Key of `job` for `migration_id`
    pub fn job_key(job: &str, migration_id: MigrationId) -> String {
        format!("{}-{}", job, migration_id)
    }

    /// Start `job` under `key`
    ///
    /// Returns false, leaving the running job alone, if a job with the same
    /// key is still running.
    pub fn run_job(&self, key: &str, job: BoxTask) -> bool {
        let (handle, registration) = TaskHandle::new_pair();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        {
            let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            if jobs.contains_key(key) {
                warn!("Job {} is already running", key);
                return false;
            }
            jobs.insert(key.to_string(), RunningJob { generation, handle });
        }

        let jobs = self.jobs.clone();
        let owned_key = key.to_string();
        self.spawner.spawn_registered(
            Box::pin(async move {
                job.await;
                let mut jobs = jobs.lock().unwrap_or_else(PoisonError::into_inner);
                // A newer job may have taken the key after an abort
                if jobs.get(&owned_key).map(|j| j.generation) == Some(generation) {
                    jobs.remove(&owned_key);
                }
                debug!("Job {} finished", owned_key);
            }),
            registration,
        );

        info!("Started job {}", key);
        true
    }

    /// Abort the job under `key`, returning whether one was running
    pub fn abort_job_if_present(&self, key: &str) -> bool {
        let removed = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);

        match removed {
            Some(job) => {
                job.handle.abort();
                info!("Aborted job {}", key);
                true
            }
            None => {
                debug!("No running job {} to abort", key);
                false
            }
        }
    }

    /// Whether a job is running under `key`
    pub fn is_running(&self, key: &str) -> bool {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }
}

/// One kind of per-migration job run through a [`MigrationJobRunner`]
pub struct ScheduledMigrationJob {
    job: &'static str,
    runner: Arc<MigrationJobRunner>,
}

impl ScheduledMigrationJob {
    /// Shared filesystem copy
    pub const FS_COPY: &'static str = "fs-copy";
    /// Database export
    pub const DATABASE_EXPORT: &'static str = "database-export";
    /// Final delta sync
    pub const FINAL_SYNC: &'static str = "final-sync";

    /// Jobs named `job` on `runner`
    pub fn new(job: &'static str, runner: Arc<MigrationJobRunner>) -> Self {
        Self { job, runner }
    }

    /// Job name
    pub fn job(&self) -> &'static str {
        self.job
    }

    /// Start the job for `migration_id`
    pub fn schedule(&self, migration_id: MigrationId, job: BoxTask) -> bool {
        self.runner
            .run_job(&MigrationJobRunner::job_key(self.job, migration_id), job)
    }

    /// Whether the job is running for `migration_id`
    pub fn is_scheduled(&self, migration_id: MigrationId) -> bool {
        self.runner
            .is_running(&MigrationJobRunner::job_key(self.job, migration_id))
    }
}

impl CancellableMigrationService for ScheduledMigrationJob {
    fn unschedule_migration(&self, migration_id: MigrationId) {
        self.runner
            .abort_job_if_present(&MigrationJobRunner::job_key(self.job, migration_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    impl CancellableMigrationService for Counting {
        fn unschedule_migration(&self, _migration_id: MigrationId) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_job_key_layout() {
        assert_eq!(
            MigrationJobRunner::job_key(ScheduledMigrationJob::FS_COPY, MigrationId(12)),
            "fs-copy-12"
        );
    }

    #[test]
    fn test_only_reset_events_fan_out() {
        let service = Arc::new(Counting::default());
        let coordinator = CancellationCoordinator::new(vec![
            service.clone() as Arc<dyn CancellableMigrationService>,
        ]);

        coordinator.on_event(&MigrationEvent::Created {
            migration_id: MigrationId(1),
        });
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);

        coordinator.on_event(&MigrationEvent::Reset {
            migration_id: MigrationId(1),
        });
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_attach_is_idempotent_and_detach_unregisters() {
        let publisher = EventPublisher::new();
        let coordinator = Arc::new(CancellationCoordinator::new(Vec::new()));

        coordinator.attach(&publisher);
        coordinator.attach(&publisher);
        assert_eq!(publisher.listener_count(), 1);
        assert!(coordinator.is_attached());

        coordinator.detach(&publisher);
        coordinator.detach(&publisher);
        assert_eq!(publisher.listener_count(), 0);
        assert!(!coordinator.is_attached());
    }
}
