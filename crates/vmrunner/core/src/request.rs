//! Input resolution.
//!
//! Turns the string-valued configuration bag an invocation receives into a
//! validated [`ProvisionRequest`]. Every missing field is reported at once so
//! a misconfigured workflow can be fixed in a single pass.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ProvisionerConfig;
use crate::error::{ProvisionError, ProvisionResult};
use crate::types::{parse_tags, InstanceId, MachineSizing, RepoRef, Secret};

/// Runner label used when the invocation does not name one.
pub const DEFAULT_RUNNER_LABEL: &str = "self-hosted";

const GENERATED_PASSWORD_LEN: usize = 32;

/// String-valued invocation options, keyed by input name.
///
/// Blank values are treated as absent.
#[derive(Debug, Clone, Default)]
pub struct InputBag {
    values: BTreeMap<String, String>,
}

impl InputBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an input. Later calls win.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Builder form of [`InputBag::set`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Get a trimmed, non-blank input.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for InputBag {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut bag = InputBag::new();
        for (k, v) in iter {
            bag.set(k, v);
        }
        bag
    }
}

/// What the invocation asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Destroy,
}

impl FromStr for Action {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(Action::Create),
            "destroy" => Ok(Action::Destroy),
            other => Err(ProvisionError::Configuration(format!(
                "action must be 'create' or 'destroy', got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create => f.write_str("create"),
            Action::Destroy => f.write_str("destroy"),
        }
    }
}

/// How a destroy invocation finds its VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestroyTarget {
    /// Delete this exact instance.
    Id(InstanceId),
    /// Search instances by label or tag.
    Phrase(String),
}

/// Create-only parameters.
#[derive(Debug, Clone)]
pub struct CreateParams {
    pub sizing: MachineSizing,
    pub root_password: Secret,
    pub tags: BTreeSet<String>,
}

/// Action-specific part of a request.
#[derive(Debug, Clone)]
pub enum ActionParams {
    Create(CreateParams),
    Destroy(DestroyTarget),
}

/// API credentials the clients are constructed with.
#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub github_token: Secret,
    pub provider_token: Secret,
}

/// A validated invocation.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub repo: RepoRef,
    pub runner_label: String,
    pub credentials: ApiCredentials,
    pub params: ActionParams,
}

impl ProvisionRequest {
    /// Validate a configuration bag.
    ///
    /// `config` supplies defaults for inputs that have one (region).
    pub fn resolve(inputs: &InputBag, config: &ProvisionerConfig) -> ProvisionResult<Self> {
        let action: Action = inputs
            .get("action")
            .ok_or_else(|| ProvisionError::Configuration("missing required input: action".into()))?
            .parse()?;

        let mut missing = Vec::new();
        let mut require = |key: &'static str| -> String {
            match inputs.get(key) {
                Some(v) => v.to_string(),
                None => {
                    missing.push(key);
                    String::new()
                }
            }
        };

        let owner = require("organization");
        let name = require("repo_name");
        let github_token = require("github_token");
        let provider_token = require("linode_token");

        let params = match action {
            Action::Create => {
                let machine_type = require("machine_type");
                let image = require("image");
                ActionParams::Create(CreateParams {
                    sizing: MachineSizing {
                        machine_type,
                        image,
                        region: inputs
                            .get("region")
                            .unwrap_or(config.default_region.as_str())
                            .to_string(),
                    },
                    root_password: inputs
                        .get("root_password")
                        .map(Secret::new)
                        .unwrap_or_else(generate_root_password),
                    tags: inputs.get("tags").map(parse_tags).unwrap_or_default(),
                })
            }
            Action::Destroy => {
                let target = match (inputs.get("machine_id"), inputs.get("search_phrase")) {
                    (Some(id), _) => Some(DestroyTarget::Id(InstanceId::new(id))),
                    (None, Some(phrase)) => Some(DestroyTarget::Phrase(phrase.to_string())),
                    (None, None) => None,
                };
                match target {
                    Some(target) => ActionParams::Destroy(target),
                    None => {
                        missing.push("machine_id or search_phrase");
                        ActionParams::Destroy(DestroyTarget::Phrase(String::new()))
                    }
                }
            }
        };

        if !missing.is_empty() {
            return Err(ProvisionError::Configuration(format!(
                "missing required input(s) for {}: {}",
                action,
                missing.join(", ")
            )));
        }

        Ok(Self {
            repo: RepoRef::new(owner, name),
            runner_label: inputs
                .get("runner_label")
                .unwrap_or(DEFAULT_RUNNER_LABEL)
                .to_string(),
            credentials: ApiCredentials {
                github_token: Secret::new(github_token),
                provider_token: Secret::new(provider_token),
            },
            params,
        })
    }

    pub fn action(&self) -> Action {
        match self.params {
            ActionParams::Create(_) => Action::Create,
            ActionParams::Destroy(_) => Action::Destroy,
        }
    }
}

fn generate_root_password() -> Secret {
    let password: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect();
    Secret::new(password)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_inputs(action: &str) -> InputBag {
        InputBag::new()
            .with("action", action)
            .with("organization", "acme")
            .with("repo_name", "widgets")
            .with("github_token", "ghp_test")
            .with("linode_token", "lin_test")
    }

    #[test]
    fn test_resolve_create_request() {
        let inputs = base_inputs("create")
            .with("machine_type", "g6-standard-1")
            .with("image", "linux-default")
            .with("root_password", "s3cret")
            .with("tags", "ci, ephemeral ,");
        let request = ProvisionRequest::resolve(&inputs, &ProvisionerConfig::default()).unwrap();

        assert_eq!(request.action(), Action::Create);
        assert_eq!(request.repo, RepoRef::new("acme", "widgets"));
        assert_eq!(request.runner_label, DEFAULT_RUNNER_LABEL);
        let ActionParams::Create(params) = request.params else {
            panic!("expected create params");
        };
        assert_eq!(params.sizing.machine_type, "g6-standard-1");
        assert_eq!(params.sizing.region, "us-east");
        assert_eq!(params.root_password.expose(), "s3cret");
        assert_eq!(params.tags.len(), 2);
    }

    #[test]
    fn test_create_generates_root_password() {
        let inputs = base_inputs("create")
            .with("machine_type", "g6-standard-1")
            .with("image", "linux-default");
        let request = ProvisionRequest::resolve(&inputs, &ProvisionerConfig::default()).unwrap();
        let ActionParams::Create(params) = request.params else {
            panic!("expected create params");
        };
        assert_eq!(params.root_password.expose().len(), GENERATED_PASSWORD_LEN);
    }

    #[test]
    fn test_create_requires_sizing() {
        let err = ProvisionRequest::resolve(&base_inputs("create"), &ProvisionerConfig::default())
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("machine_type"));
        assert!(message.contains("image"));
    }

    #[test]
    fn test_missing_repository_identity_reported_together() {
        let inputs = InputBag::new()
            .with("action", "destroy")
            .with("machine_id", "42")
            .with("organization", "   ");
        let err = ProvisionRequest::resolve(&inputs, &ProvisionerConfig::default()).unwrap_err();
        assert!(matches!(err, ProvisionError::Configuration(_)));
        let message = err.to_string();
        assert!(message.contains("organization"));
        assert!(message.contains("repo_name"));
        assert!(message.contains("github_token"));
    }

    #[test]
    fn test_destroy_requires_target() {
        let err = ProvisionRequest::resolve(&base_inputs("destroy"), &ProvisionerConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("machine_id or search_phrase"));
    }

    #[test]
    fn test_destroy_prefers_machine_id() {
        let inputs = base_inputs("destroy")
            .with("machine_id", "42")
            .with("search_phrase", "ci-runner");
        let request = ProvisionRequest::resolve(&inputs, &ProvisionerConfig::default()).unwrap();
        assert!(matches!(
            request.params,
            ActionParams::Destroy(DestroyTarget::Id(ref id)) if id.as_str() == "42"
        ));
    }

    #[test]
    fn test_destroy_by_phrase() {
        let inputs = base_inputs("destroy").with("search_phrase", "ci-runner-7");
        let request = ProvisionRequest::resolve(&inputs, &ProvisionerConfig::default()).unwrap();
        assert!(matches!(
            request.params,
            ActionParams::Destroy(DestroyTarget::Phrase(ref p)) if p == "ci-runner-7"
        ));
    }

    #[test]
    fn test_invalid_action() {
        let err = ProvisionRequest::resolve(&base_inputs("restart"), &ProvisionerConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("'restart'"));
    }

    #[test]
    fn test_action_is_case_insensitive() {
        assert_eq!("Create".parse::<Action>().unwrap(), Action::Create);
        assert_eq!(" DESTROY ".parse::<Action>().unwrap(), Action::Destroy);
    }
}
