//! Stopping and starting the application on its instance

use crate::{
    Result,
    deployment::InstanceLocator,
    orchestrator::Orchestrator,
    remote::{CommandParameters, runner::RemoteCommandRunner},
};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Document that runs shell commands on an instance
pub const AWS_RUN_SHELL_SCRIPT: &str = "AWS-RunShellScript";

/// Desired run state of the application service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteServiceState {
    /// `systemctl start`
    Start,
    /// `systemctl stop`
    Stop,
}

impl RemoteServiceState {
    fn verb(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

/// Controls the application service on the application stack's instance
pub struct ApplicationServiceController {
    runner: Arc<RemoteCommandRunner>,
    orchestrator: Arc<Orchestrator>,
    instances: Arc<dyn InstanceLocator>,
    service_name: String,
    shell_document: String,
}

impl ApplicationServiceController {
    /// Create a controller for `service_name`, run through `shell_document`
    pub fn new(
        runner: Arc<RemoteCommandRunner>,
        orchestrator: Arc<Orchestrator>,
        instances: Arc<dyn InstanceLocator>,
        service_name: impl Into<String>,
        shell_document: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            orchestrator,
            instances,
            service_name: service_name.into(),
            shell_document: shell_document.into(),
        }
    }

    /// Stop the service
    pub async fn stop(&self) -> Result<Option<String>> {
        self.set_run_state(RemoteServiceState::Stop).await
    }

    /// Start the service
    pub async fn start(&self) -> Result<Option<String>> {
        self.set_run_state(RemoteServiceState::Start).await
    }

    /// Ask the application instance to move the service to `state`
    ///
    /// Returns the command id, or `None` when there is no application stack
    /// or no instance to send the command to.
    pub async fn set_run_state(&self, state: RemoteServiceState) -> Result<Option<String>> {
        let context = self.orchestrator.current_context().await?;
        let Some(stack_name) = context.application_deployment_id() else {
            warn!(
                "No application stack recorded, not trying to {} {}",
                state.verb(),
                self.service_name
            );
            return Ok(None);
        };

        let instance_id = match self.instances.instance_for_stack(stack_name).await {
            Ok(Some(instance_id)) => instance_id,
            Ok(None) => {
                warn!(
                    "No instance found for stack {}, not trying to {} {}",
                    stack_name,
                    state.verb(),
                    self.service_name
                );
                return Ok(None);
            }
            Err(e) => {
                warn!(
                    "Unable to look up instance of stack {}, not trying to {} {}: {}",
                    stack_name,
                    state.verb(),
                    self.service_name,
                    e
                );
                return Ok(None);
            }
        };

        let mut params = CommandParameters::new();
        params.insert(
            "commands".to_string(),
            vec![format!("sudo systemctl {} {}", state.verb(), self.service_name)],
        );

        info!(
            "Sending {} {} to instance {}",
            state.verb(),
            self.service_name,
            instance_id
        );
        let command_id = self
            .runner
            .run(&self.shell_document, &instance_id, &params)
            .await?;
        Ok(Some(command_id))
    }
}

/// Run `work` with the application service stopped
///
/// The service is started again on every exit path: success, error, and
/// panic (which is resumed after the restart). A failure to stop is logged
/// and `work` still runs.
pub async fn with_service_stopped<T, F, Fut>(
    controller: &ApplicationServiceController,
    work: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if let Err(e) = controller.stop().await {
        warn!("Failed to stop {}: {}", controller.service_name, e);
    }

    let outcome = AssertUnwindSafe(work()).catch_unwind().await;

    if let Err(e) = controller.start().await {
        error!("Failed to start {}: {}", controller.service_name, e);
    }

    match outcome {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
