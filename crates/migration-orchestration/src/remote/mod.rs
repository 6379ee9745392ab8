//! Remote command execution on cloud instances
//!
//! Commands are documents run on a target instance by a remote command API.
//! A run returns a command id, the durable handle used to query the
//! invocation afterwards.

pub mod critical;
pub mod fs_restore;
pub mod restore;
pub mod runner;
pub mod service;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Document parameters: each parameter takes a list of values
pub type CommandParameters = BTreeMap<String, Vec<String>>;

/// Status of one command invocation on one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandStatus {
    /// Accepted, not yet running
    Pending,
    /// Running
    InProgress,
    /// Waiting to be retried by the remote system
    Delayed,
    /// Finished successfully
    Success,
    /// Cancellation requested
    Cancelling,
    /// Cancelled before finishing
    Cancelled,
    /// Exceeded its execution timeout
    TimedOut,
    /// Finished unsuccessfully
    Failed,
}

impl CommandStatus {
    /// No further progress is expected
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Cancelled | Self::TimedOut | Self::Failed
        )
    }

    /// Finished successfully
    pub fn is_success(&self) -> bool {
        *self == Self::Success
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "Pending",
            Self::InProgress => "InProgress",
            Self::Delayed => "Delayed",
            Self::Success => "Success",
            Self::Cancelling => "Cancelling",
            Self::Cancelled => "Cancelled",
            Self::TimedOut => "TimedOut",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Result of querying one invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInvocation {
    /// Command identifier
    pub command_id: String,
    /// Instance the command ran on
    pub instance_id: String,
    /// Current status
    pub status: CommandStatus,
    /// Captured standard output
    pub stdout: Option<String>,
    /// Captured standard error
    pub stderr: Option<String>,
}

/// Remote command API
#[async_trait]
pub trait RemoteCommandApi: Send + Sync {
    /// Start `document` on `instance_id`, returning the command id
    async fn run_document(
        &self,
        document: &str,
        instance_id: &str,
        params: &CommandParameters,
    ) -> Result<String>;

    /// Query an invocation started by [`RemoteCommandApi::run_document`]
    async fn get_command_invocation(
        &self,
        command_id: &str,
        instance_id: &str,
    ) -> Result<CommandInvocation>;

    /// Key prefix under which command output is stored in the bucket
    fn output_key_prefix(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        use CommandStatus::*;
        for status in [Success, Cancelled, TimedOut, Failed] {
            assert!(status.is_terminal(), "{status}");
        }
        for status in [Pending, InProgress, Delayed, Cancelling] {
            assert!(!status.is_terminal(), "{status}");
        }
        assert!(Success.is_success());
        assert!(!Failed.is_success());
    }
}
