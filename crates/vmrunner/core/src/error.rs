//! Error types for vmrunner-core.
//!
//! One taxonomy covers every step of the create and destroy workflows so the
//! orchestrator can decide whether a failure needs cleanup.

use thiserror::Error;

/// Errors that can occur while provisioning or tearing down a runner VM.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Invocation input is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The cloud provider answered with a non-success status.
    #[error("provider error: {status} - {message}")]
    Provider { status: u16, message: String },

    /// The CI service answered with a non-success status.
    #[error("registry error: {status} - {message}")]
    Registry { status: u16, message: String },

    /// The provider has not assigned the new VM a public address.
    #[error("instance {instance_id} has no public address")]
    AddressUnavailable { instance_id: String },

    /// The VM never accepted a remote command.
    #[error("timed out waiting for {address} to accept remote commands after {attempts} attempts")]
    Timeout { address: String, attempts: u32 },

    /// No instance matched a destroy search phrase.
    #[error("no instance matches search phrase '{phrase}'")]
    NotFound { phrase: String },

    /// Several instances matched a destroy search phrase.
    #[error("search phrase '{phrase}' matches {} instances ({}); refine it or pass a machine id", candidates.len(), candidates.join(", "))]
    AmbiguousMatch {
        phrase: String,
        candidates: Vec<String>,
    },

    /// The runner configuration script failed on the VM.
    #[error("runner configuration failed on {address} (exit code {}): {output}", exit_code.map(|c| c.to_string()).unwrap_or_else(|| "none".into()))]
    RemoteConfiguration {
        address: String,
        exit_code: Option<i32>,
        output: String,
    },

    /// The remote shell could not be started at all.
    #[error("remote shell to {address} failed: {reason}")]
    RemoteShell { address: String, reason: String },

    /// The runner script template could not be rendered.
    #[error("template error: {0}")]
    Template(String),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    /// Whether this failure, raised mid-create, leaves a VM behind that must
    /// be cleaned up.
    ///
    /// Input validation and destroy-time lookup errors happen before anything
    /// is created.
    pub fn triggers_cleanup(&self) -> bool {
        !matches!(
            self,
            ProvisionError::Configuration(_)
                | ProvisionError::NotFound { .. }
                | ProvisionError::AmbiguousMatch { .. }
        )
    }
}

/// Result type for provisioning operations.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguous_match_lists_candidates() {
        let err = ProvisionError::AmbiguousMatch {
            phrase: "ci-runner-7".into(),
            candidates: vec!["101".into(), "102".into()],
        };
        let message = err.to_string();
        assert!(message.contains("matches 2 instances"));
        assert!(message.contains("101, 102"));
    }

    #[test]
    fn test_timeout_names_address_and_attempts() {
        let err = ProvisionError::Timeout {
            address: "192.0.2.10".into(),
            attempts: 10,
        };
        assert_eq!(
            err.to_string(),
            "timed out waiting for 192.0.2.10 to accept remote commands after 10 attempts"
        );
    }

    #[test]
    fn test_cleanup_classification() {
        assert!(!ProvisionError::Configuration("x".into()).triggers_cleanup());
        assert!(!ProvisionError::NotFound { phrase: "x".into() }.triggers_cleanup());
        assert!(ProvisionError::Timeout {
            address: "a".into(),
            attempts: 1
        }
        .triggers_cleanup());
        assert!(ProvisionError::Registry {
            status: 403,
            message: "forbidden".into()
        }
        .triggers_cleanup());
        assert!(ProvisionError::AddressUnavailable {
            instance_id: "4242".into()
        }
        .triggers_cleanup());
    }

    #[test]
    fn test_remote_configuration_without_exit_code() {
        let err = ProvisionError::RemoteConfiguration {
            address: "192.0.2.10".into(),
            exit_code: None,
            output: "killed".into(),
        };
        assert!(err.to_string().contains("exit code none"));
    }
}
