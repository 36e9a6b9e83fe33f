//! Provisioner configuration.
//!
//! Defines API endpoints, readiness probing and remote shell behaviour.
//! Every field has a default so a partial config file is enough.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the provisioner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Base URL of the cloud provider API.
    pub provider_endpoint: String,

    /// Base URL of the CI service API.
    pub registry_endpoint: String,

    /// Region used when the invocation does not name one.
    pub default_region: String,

    /// Version of the runner agent installed on new VMs.
    pub runner_version: String,

    /// Timeout applied to every HTTP request, in seconds.
    pub http_timeout_secs: u64,

    /// Readiness probe settings.
    pub readiness: ReadinessConfig,

    /// Remote shell settings.
    pub ssh: SshConfig,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            provider_endpoint: "https://api.linode.com/v4".to_string(),
            registry_endpoint: "https://api.github.com".to_string(),
            default_region: "us-east".to_string(),
            runner_version: "2.319.1".to_string(),
            http_timeout_secs: 30,
            readiness: ReadinessConfig::default(),
            ssh: SshConfig::default(),
        }
    }
}

impl ProvisionerConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Readiness probe configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Attempts before giving up.
    pub max_attempts: u32,

    /// Fixed pause between attempts, in seconds.
    pub interval_secs: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            interval_secs: 30,
        }
    }
}

impl ReadinessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Remote shell configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Login user on the VM.
    pub user: String,

    /// `ConnectTimeout` passed to ssh, in seconds.
    pub connect_timeout_secs: u64,

    /// Upper bound for a single remote command, in seconds.
    pub command_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            connect_timeout_secs: 10,
            command_timeout_secs: 900,
        }
    }
}
