//! Submit a stack and watch it until it reaches a terminal state
//!
//! Each deployment runs two background tasks on the configured spawner:
//!
//! - a poller that queries the stack status every `poll_interval`, starting
//!   immediately, and records every observed status
//! - a watchdog that fails the deployment once `timeout` has elapsed
//!
//! Whichever task reaches a terminal decision first claims the deployment
//! through a single compare-and-swap, fires its callback and aborts the
//! other task. The loser never fires a callback.
//!
//! Every deployment belongs to one migration. Resetting that migration
//! claims the deployment without a callback and aborts both tasks, see
//! [`DeploymentWatcher`]'s [`CancellableMigrationService`] impl.

use crate::{
    Error, Result,
    cancellation::CancellableMigrationService,
    config::DeploymentConfig,
    deployment::{DeploymentCallbacks, DeploymentStatusRecorder, StackApi, StackParameters},
};
use async_runtime_compat::{Spawner, TaskHandle, runtime_utils::sleep};
use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use migration_state::MigrationId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Reason reported when a failed stack gives no root cause
pub const UNKNOWN_FAILURE_REASON: &str =
    "Deployment failed for unknown reason. Try checking the cloudformation console";

/// How a deployment ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentOutcome {
    /// The stack was created
    Succeeded,
    /// The stack failed, or its status could not be read
    Failed(String),
    /// The watchdog fired before the stack finished
    TimedOut(String),
    /// The owning migration was reset before the stack finished
    Cancelled,
}

impl DeploymentOutcome {
    /// Whether the stack was created
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Failure reason passed to the failure callback
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Succeeded | Self::Cancelled => None,
            Self::Failed(reason) | Self::TimedOut(reason) => Some(reason),
        }
    }
}

/// State shared by the poller and the watchdog of one deployment
struct DeploymentTask {
    migration_id: MigrationId,
    stack_name: String,
    completed: AtomicBool,
    callbacks: Arc<dyn DeploymentCallbacks>,
    outcome: Mutex<Option<oneshot::Sender<DeploymentOutcome>>>,
    poller: TaskHandle,
    watchdog: TaskHandle,
}

impl DeploymentTask {
    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// True for exactly one caller over the lifetime of the task
    fn claim(&self) -> bool {
        self.completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn resolve(&self, outcome: DeploymentOutcome) {
        let sender = self
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            // Nobody waiting is fine
            let _ = sender.send(outcome);
        }
    }

    /// Stop both tasks without firing a callback
    fn cancel(&self) {
        if self.claim() {
            self.resolve(DeploymentOutcome::Cancelled);
            self.poller.abort();
            self.watchdog.abort();
        }
    }
}

/// Handle for synchronizing with a running deployment
///
/// Terminal handling belongs in the [`DeploymentCallbacks`]; the handle only
/// reports when and how the deployment ended.
#[derive(Clone)]
pub struct DeploymentHandle {
    task: Arc<DeploymentTask>,
    outcome: Shared<BoxFuture<'static, Option<DeploymentOutcome>>>,
}

impl DeploymentHandle {
    /// Migration the deployment belongs to
    pub fn migration_id(&self) -> MigrationId {
        self.task.migration_id
    }

    /// Stack being watched
    pub fn stack_name(&self) -> &str {
        &self.task.stack_name
    }

    /// Whether a terminal callback has been claimed
    pub fn is_complete(&self) -> bool {
        self.task.is_completed()
    }

    /// Wait until the deployment ends
    ///
    /// Returns `None` if both background tasks were dropped without an
    /// outcome, which only happens when the runtime shuts down.
    pub async fn wait(&self) -> Option<DeploymentOutcome> {
        self.outcome.clone().await
    }
}

impl std::fmt::Debug for DeploymentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentHandle")
            .field("migration_id", &self.task.migration_id)
            .field("stack_name", &self.task.stack_name)
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Generic stack deployment engine
pub struct DeploymentWatcher {
    stacks: Arc<dyn StackApi>,
    recorder: Arc<dyn DeploymentStatusRecorder>,
    spawner: Arc<dyn Spawner>,
    poll_interval: Duration,
    timeout: Duration,
    active: Mutex<HashMap<MigrationId, Vec<Arc<DeploymentTask>>>>,
}

impl DeploymentWatcher {
    /// Create a watcher polling every 30 seconds with a one hour timeout
    pub fn new(
        stacks: Arc<dyn StackApi>,
        recorder: Arc<dyn DeploymentStatusRecorder>,
        spawner: Arc<dyn Spawner>,
    ) -> Self {
        Self::from_config(stacks, recorder, spawner, &DeploymentConfig::default())
    }

    /// Create a watcher with the intervals of `config`
    pub fn from_config(
        stacks: Arc<dyn StackApi>,
        recorder: Arc<dyn DeploymentStatusRecorder>,
        spawner: Arc<dyn Spawner>,
        config: &DeploymentConfig,
    ) -> Self {
        Self {
            stacks,
            recorder,
            spawner,
            poll_interval: config.poll_interval(),
            timeout: config.timeout(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Set the interval between status polls
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set how long a deployment may take
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Stack API the watcher polls
    pub fn stacks(&self) -> &Arc<dyn StackApi> {
        &self.stacks
    }

    /// Whether a deployment of `migration_id` is still running
    pub fn is_watching(&self, migration_id: MigrationId) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&migration_id)
            .is_some_and(|tasks| tasks.iter().any(|task| !task.is_completed()))
    }

    /// Submit a stack for `migration_id` and start watching it
    ///
    /// A rejected submission fires `on_failure` once and returns
    /// [`Error::InfrastructureDeployment`] without starting any task.
    pub async fn deploy(
        &self,
        migration_id: MigrationId,
        template_url: &str,
        stack_name: &str,
        params: &StackParameters,
        callbacks: Arc<dyn DeploymentCallbacks>,
    ) -> Result<DeploymentHandle> {
        info!("Provisioning stack {} from {}", stack_name, template_url);

        if let Err(e) = self
            .stacks
            .provision_stack(template_url, stack_name, params)
            .await
        {
            let reason = format!("unable to provision stack {}: {}", stack_name, e);
            error!("{}", reason);
            callbacks.on_failure(reason.clone()).await;
            return Err(Error::InfrastructureDeployment(reason));
        }

        Ok(self.watch(migration_id, stack_name, callbacks))
    }

    /// Watch a stack of `migration_id` that has already been submitted
    ///
    /// Used to resume watching after the controlling process restarts.
    pub fn watch(
        &self,
        migration_id: MigrationId,
        stack_name: &str,
        callbacks: Arc<dyn DeploymentCallbacks>,
    ) -> DeploymentHandle {
        let (sender, receiver) = oneshot::channel();
        let (poller, poller_registration) = TaskHandle::new_pair();
        let (watchdog, watchdog_registration) = TaskHandle::new_pair();

        let task = Arc::new(DeploymentTask {
            migration_id,
            stack_name: stack_name.to_string(),
            completed: AtomicBool::new(false),
            callbacks,
            outcome: Mutex::new(Some(sender)),
            poller,
            watchdog,
        });

        {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            active.retain(|_, tasks| {
                tasks.retain(|task| !task.is_completed());
                !tasks.is_empty()
            });
            active.entry(migration_id).or_default().push(task.clone());
        }

        self.spawner.spawn_registered(
            Box::pin(poll_until_terminal(
                task.clone(),
                self.stacks.clone(),
                self.recorder.clone(),
                self.poll_interval,
            )),
            poller_registration,
        );
        self.spawner.spawn_registered(
            Box::pin(fail_after_timeout(task.clone(), self.timeout)),
            watchdog_registration,
        );

        debug!(
            "Watching stack {} of migration {} every {:?} with timeout {:?}",
            stack_name, migration_id, self.poll_interval, self.timeout
        );

        DeploymentHandle {
            task,
            outcome: receiver.map(|received| received.ok()).boxed().shared(),
        }
    }
}

impl CancellableMigrationService for DeploymentWatcher {
    fn unschedule_migration(&self, migration_id: MigrationId) {
        let tasks = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&migration_id)
            .unwrap_or_default();

        for task in tasks {
            if !task.is_completed() {
                info!(
                    "Cancelling deployment of stack {} for reset migration {}",
                    task.stack_name, migration_id
                );
            }
            task.cancel();
        }
    }
}

async fn poll_until_terminal(
    task: Arc<DeploymentTask>,
    stacks: Arc<dyn StackApi>,
    recorder: Arc<dyn DeploymentStatusRecorder>,
    poll_interval: Duration,
) {
    let stack_name = task.stack_name.as_str();

    loop {
        if task.is_completed() {
            return;
        }

        match stacks.get_status(stack_name).await {
            Ok(state) => {
                match recorder
                    .record_deployment_state(task.migration_id, state)
                    .await
                {
                    Ok(()) => {}
                    Err(Error::MigrationNotCurrent(_)) => {
                        warn!(
                            "Migration {} was reset, stopping watch of stack {}",
                            task.migration_id, stack_name
                        );
                        task.cancel();
                        return;
                    }
                    Err(e) => {
                        warn!("Failed to record status {} of stack {}: {}", state, stack_name, e);
                    }
                }

                if state.is_success() {
                    if task.claim() {
                        info!("Stack {} creation succeeded", stack_name);
                        task.callbacks.on_success().await;
                        task.resolve(DeploymentOutcome::Succeeded);
                        task.watchdog.abort();
                    }
                    return;
                }

                if state.is_failure() {
                    let reason = failure_reason(stacks.as_ref(), stack_name).await;
                    if task.claim() {
                        error!("Stack {} creation failed with reason {}", stack_name, reason);
                        task.callbacks.on_failure(reason.clone()).await;
                        task.resolve(DeploymentOutcome::Failed(reason));
                        task.watchdog.abort();
                    }
                    return;
                }

                debug!("Stack {} is {}", stack_name, state);
            }
            Err(e) => {
                warn!("Unable to read status of stack {}: {}", stack_name, e);
                let reason = failure_reason(stacks.as_ref(), stack_name).await;
                if task.claim() {
                    task.callbacks.on_failure(reason.clone()).await;
                    task.resolve(DeploymentOutcome::Failed(reason));
                    task.watchdog.abort();
                }
                return;
            }
        }

        sleep(poll_interval).await;
    }
}

async fn fail_after_timeout(task: Arc<DeploymentTask>, timeout: Duration) {
    sleep(timeout).await;

    if task.claim() {
        let reason = format!("timed out while waiting for stack {} to deploy", task.stack_name);
        error!("{}", reason);
        task.callbacks.on_failure(reason.clone()).await;
        task.resolve(DeploymentOutcome::TimedOut(reason));
        task.poller.abort();
    }
}

async fn failure_reason(stacks: &dyn StackApi, stack_name: &str) -> String {
    match stacks.get_stack_error_root_cause(stack_name).await {
        Ok(Some(reason)) if !reason.trim().is_empty() => reason,
        Ok(_) => UNKNOWN_FAILURE_REASON.to_string(),
        Err(e) => {
            warn!("Unable to read failure cause of stack {}: {}", stack_name, e);
            UNKNOWN_FAILURE_REASON.to_string()
        }
    }
}
