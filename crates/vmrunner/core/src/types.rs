//! Core data model shared by the provider, registry and workflow modules.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider-assigned identifier of a VM instance.
///
/// Opaque to the workflow; the Linode API uses integers but nothing here
/// relies on that.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A credential that must never show up in logs or debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the raw value. Call sites should hand it straight to the
    /// transport that needs it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Repository the runner is registered against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Browser URL of the repository, as the runner agent expects it.
    pub fn html_url(&self) -> String {
        format!("https://github.com/{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Machine sizing for a new VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSizing {
    /// Provider plan, e.g. `g6-standard-1`.
    pub machine_type: String,
    /// Provider image slug.
    pub image: String,
    /// Provider region.
    pub region: String,
}

/// Everything the provider needs to create one VM.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub sizing: MachineSizing,
    pub root_password: Secret,
    pub label: String,
    pub tags: BTreeSet<String>,
}

/// A VM as seen through the provider API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInstance {
    pub id: InstanceId,
    /// First public IPv4 address, if the provider has assigned one yet.
    pub address: Option<String>,
    pub label: String,
    pub tags: BTreeSet<String>,
}

/// Short-lived token that lets a new runner register itself.
#[derive(Debug, Clone)]
pub struct RegistrationCredential {
    pub token: Secret,
    pub expires_at: Option<DateTime<Utc>>,
}

/// The CI service's record of a registered runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerRegistration {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub labels: BTreeSet<String>,
}

impl RunnerRegistration {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }
}

/// How a runner registration is looked up.
///
/// Names are unique per repository; a label such as `self-hosted` is shared
/// by every self-hosted runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerSelector {
    Name(String),
    Label(String),
}

impl RunnerSelector {
    pub fn matches(&self, runner: &RunnerRegistration) -> bool {
        match self {
            RunnerSelector::Name(name) => runner.name == *name,
            RunnerSelector::Label(label) => runner.has_label(label),
        }
    }
}

impl fmt::Display for RunnerSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerSelector::Name(name) => write!(f, "name={}", name),
            RunnerSelector::Label(label) => write!(f, "label={}", label),
        }
    }
}

/// Parse a comma-separated tag list into a set of trimmed, non-empty tags.
pub fn parse_tags(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}
