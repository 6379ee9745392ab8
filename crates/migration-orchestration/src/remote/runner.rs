//! Run remote documents and wait for their results

use crate::{
    Error, Result,
    config::RemoteCommandConfig,
    remote::{
        CommandInvocation, CommandParameters, CommandStatus, RemoteCommandApi,
        critical::CriticalErrorClassifier,
    },
};
use async_runtime_compat::runtime_utils::sleep;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub use migration_state::RemoteCommandInvocation;

/// Classified result of an invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Command identifier
    pub command_id: String,
    /// Instance the command ran on
    pub instance_id: String,
    /// Status when queried
    pub status: CommandStatus,
    /// Captured standard error
    pub stderr: Option<String>,
    /// Whether stderr matched a fatal pattern
    pub is_critical: bool,
}

/// Runs documents through a [`RemoteCommandApi`]
pub struct RemoteCommandRunner {
    api: Arc<dyn RemoteCommandApi>,
    classifier: CriticalErrorClassifier,
    poll_interval: Duration,
    max_attempts: u32,
}

impl RemoteCommandRunner {
    /// Create a runner with the default remote command settings
    pub fn new(api: Arc<dyn RemoteCommandApi>) -> Self {
        Self::from_config(api, &RemoteCommandConfig::default())
    }

    /// Create a runner from `config`
    pub fn from_config(api: Arc<dyn RemoteCommandApi>, config: &RemoteCommandConfig) -> Self {
        Self {
            api,
            classifier: CriticalErrorClassifier::with_extra_patterns(
                config.extra_critical_patterns.iter().cloned(),
            ),
            poll_interval: config.poll_interval(),
            max_attempts: config.max_attempts,
        }
    }

    /// Set the interval between invocation polls
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set how many polls [`RemoteCommandRunner::wait_for_success`] makes
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Classifier applied to stderr
    pub fn classifier(&self) -> &CriticalErrorClassifier {
        &self.classifier
    }

    /// Key prefix of command output in the migration bucket
    pub fn output_key_prefix(&self) -> String {
        self.api.output_key_prefix()
    }

    /// Start `document` on `target`
    pub async fn run(
        &self,
        document: &str,
        target: &str,
        params: &CommandParameters,
    ) -> Result<String> {
        info!("Running document {} on instance {}", document, target);

        let command_id = self
            .api
            .run_document(document, target, params)
            .await
            .map_err(|e| {
                error!("Unable to run document {} on {}: {}", document, target, e);
                Error::CommandLaunch(format!("{} on {}: {}", document, target, e))
            })?;

        debug!("Document {} started as command {}", document, command_id);
        Ok(command_id)
    }

    /// Query and classify an invocation
    pub async fn fetch_result(&self, command_id: &str, target: &str) -> Result<CommandResult> {
        let invocation = self.api.get_command_invocation(command_id, target).await?;
        Ok(self.classify(invocation))
    }

    /// [`RemoteCommandRunner::fetch_result`] blocking the calling thread
    ///
    /// Only for threads dedicated to long-running jobs; never call this from
    /// inside an async task.
    pub fn fetch_result_blocking(&self, command_id: &str, target: &str) -> Result<CommandResult> {
        futures::executor::block_on(self.fetch_result(command_id, target))
    }

    /// Poll until the invocation is terminal
    ///
    /// A terminal status other than success, or running out of attempts,
    /// returns [`Error::UnsuccessfulCommand`]. API errors are returned as-is
    /// without retrying.
    pub async fn wait_for_success(
        &self,
        command_id: &str,
        target: &str,
    ) -> Result<CommandInvocation> {
        let mut last_status = CommandStatus::Pending;

        for attempt in 1..=self.max_attempts {
            let invocation = self.api.get_command_invocation(command_id, target).await?;
            last_status = invocation.status;

            if invocation.status.is_success() {
                info!("Command {} succeeded on {}", command_id, target);
                return Ok(invocation);
            }
            if invocation.status.is_terminal() {
                error!(
                    "Command {} finished with status {} on {}: {}",
                    command_id,
                    invocation.status,
                    target,
                    invocation.stderr.as_deref().unwrap_or_default()
                );
                return Err(Error::UnsuccessfulCommand {
                    command_id: command_id.to_string(),
                    status: invocation.status,
                });
            }

            debug!(
                "Command {} is {} (attempt {}/{})",
                command_id, invocation.status, attempt, self.max_attempts
            );
            if attempt < self.max_attempts {
                sleep(self.poll_interval).await;
            }
        }

        warn!(
            "Command {} still {} after {} attempts",
            command_id, last_status, self.max_attempts
        );
        Err(Error::UnsuccessfulCommand {
            command_id: command_id.to_string(),
            status: last_status,
        })
    }

    /// Whether `stderr` contains a fatal pattern
    pub fn is_critical(&self, stderr: Option<&str>) -> bool {
        self.classifier.is_critical(stderr)
    }

    fn classify(&self, invocation: CommandInvocation) -> CommandResult {
        let is_critical = self.classifier.is_critical(invocation.stderr.as_deref());
        CommandResult {
            command_id: invocation.command_id,
            instance_id: invocation.instance_id,
            status: invocation.status,
            stderr: invocation.stderr,
            is_critical,
        }
    }
}
