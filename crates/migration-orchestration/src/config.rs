//! Engine configuration
//!
//! Every field has a default, so an empty YAML document is a valid
//! configuration:
//!
//! ```yaml
//! deployment:
//!   poll_interval_secs: 30
//!   timeout_secs: 3600
//! remote:
//!   service_name: jira
//!   extra_critical_patterns:
//!     - "FATAL:  password authentication failed"
//! helper:
//!   instance_id: i-0123456789abcdef0
//! mode: no-verify
//! ```

use crate::{Error, Result, mode::MigrationMode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Template used for the application stack
pub const DEFAULT_APPLICATION_TEMPLATE_URL: &str =
    "https://trebuchet-public-resources.s3.amazonaws.com/quickstart-jira-dc-with-vpc.template.yaml";

/// Template used for the migration helper stack
pub const DEFAULT_HELPER_TEMPLATE_URL: &str =
    "https://trebuchet-aws-resources.s3.amazonaws.com/migration-helper.yml";

/// Top level configuration for the migration engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// Stack deployment settings
    pub deployment: DeploymentConfig,
    /// Remote command settings
    pub remote: RemoteCommandConfig,
    /// Values that replace migration helper stack outputs
    pub helper: HelperOverrides,
    /// How stage workers gate their operations
    pub mode: MigrationMode,
}

impl OrchestrationConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.deployment.poll_interval_secs == 0 {
            return Err(Error::Config(
                "deployment.poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.deployment.timeout_secs == 0 {
            return Err(Error::Config(
                "deployment.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.remote.poll_interval_secs == 0 {
            return Err(Error::Config(
                "remote.poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.remote.max_attempts == 0 {
            return Err(Error::Config(
                "remote.max_attempts must be greater than zero".to_string(),
            ));
        }
        if self.remote.service_name.trim().is_empty() {
            return Err(Error::Config("remote.service_name must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Stack deployment settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Seconds between stack status polls
    pub poll_interval_secs: u64,
    /// Seconds before a deployment is failed as timed out
    pub timeout_secs: u64,
    /// Template for the application stack
    pub application_template_url: String,
    /// Template for the migration helper stack
    pub helper_template_url: String,
    /// Instance type passed to the helper stack
    pub helper_instance_type: String,
}

impl DeploymentConfig {
    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            timeout_secs: 60 * 60,
            application_template_url: DEFAULT_APPLICATION_TEMPLATE_URL.to_string(),
            helper_template_url: DEFAULT_HELPER_TEMPLATE_URL.to_string(),
            helper_instance_type: "c5.large".to_string(),
        }
    }
}

/// Remote command settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteCommandConfig {
    /// Seconds between invocation status polls
    pub poll_interval_secs: u64,
    /// Polls before giving up on a command
    pub max_attempts: u32,
    /// Substrings treated as fatal in addition to the built-in ones
    pub extra_critical_patterns: Vec<String>,
    /// systemd unit of the application on its instance
    pub service_name: String,
    /// Document used to run shell commands on an instance
    pub shell_document: String,
}

impl RemoteCommandConfig {
    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for RemoteCommandConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            max_attempts: 360,
            extra_critical_patterns: Vec::new(),
            service_name: "jira".to_string(),
            shell_document: crate::remote::service::AWS_RUN_SHELL_SCRIPT.to_string(),
        }
    }
}

/// Operator supplied replacements for migration helper stack outputs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperOverrides {
    /// Filesystem download document
    pub fs_restore_document: Option<String>,
    /// Filesystem download status document
    pub fs_restore_status_document: Option<String>,
    /// Database restore document
    pub rds_restore_document: Option<String>,
    /// Migration bucket
    pub migration_bucket_name: Option<String>,
    /// Helper instance, bypassing the auto-scaling group lookup
    pub instance_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = OrchestrationConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, OrchestrationConfig::default());
        assert_eq!(config.deployment.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.deployment.timeout(), Duration::from_secs(3600));
        assert_eq!(config.remote.service_name, "jira");
        assert_eq!(config.mode, MigrationMode::Default);
    }

    #[test]
    fn test_partial_document() {
        let yaml = r#"
deployment:
  timeout_secs: 120
remote:
  extra_critical_patterns:
    - "password authentication failed"
helper:
  instance_id: i-0abc
mode: no-verify
"#;
        let config = OrchestrationConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.deployment.timeout_secs, 120);
        assert_eq!(config.deployment.poll_interval_secs, 30);
        assert_eq!(config.remote.extra_critical_patterns.len(), 1);
        assert_eq!(config.helper.instance_id.as_deref(), Some("i-0abc"));
        assert_eq!(config.mode, MigrationMode::NoVerify);
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        let err = OrchestrationConfig::from_yaml_str("deployment:\n  poll_interval_secs: 0\n")
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err =
            OrchestrationConfig::from_yaml_str("remote:\n  max_attempts: 0\n").unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("migration.yaml");
        std::fs::write(&path, "mode: passthrough\n").unwrap();

        let config = OrchestrationConfig::load(&path).unwrap();
        assert_eq!(config.mode, MigrationMode::Passthrough);

        assert!(matches!(
            OrchestrationConfig::load(dir.path().join("missing.yaml")),
            Err(Error::Io(_))
        ));
    }
}
