//! CLI error types

use thiserror::Error;
use vmrunner_core::ProvisionError;

/// CLI error types
#[derive(Debug, Error)]
pub enum CliError {
    /// Provisioning workflow error
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type for CLI operations
pub type CliResult<T> = Result<T, CliError>;
