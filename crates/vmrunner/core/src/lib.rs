//! # vmrunner-core - Ephemeral VM-backed CI runners
//!
//! Provisions a cloud VM, turns it into a self-hosted CI runner and tears it
//! down again. Each invocation is one stateless transaction against three
//! external systems:
//!
//! - a cloud provider ([`provider::VmProvider`], Linode API),
//! - a CI service ([`registry::RunnerRegistry`], GitHub Actions API),
//! - the VM itself over a remote shell ([`remote::RemoteShell`], ssh).
//!
//! ## Key Components
//!
//! - [`request`]: validates the string-valued invocation inputs
//! - [`readiness`]: bounded, fixed-interval wait for a new VM to accept commands
//! - [`remote`]: runner bootstrap script and its execution
//! - [`workflow`]: create/destroy state machine and cleanup-on-failure
//!
//! ## Example
//!
//! ```rust,no_run
//! use vmrunner_core::{InputBag, Orchestrator, ProvisionerConfig, Services};
//!
//! # async fn example() -> vmrunner_core::ProvisionResult<()> {
//! let config = ProvisionerConfig::default();
//! let inputs = InputBag::new()
//!     .with("action", "destroy")
//!     .with("organization", "acme")
//!     .with("repo_name", "widgets")
//!     .with("github_token", "github-token")
//!     .with("linode_token", "linode-token")
//!     .with("search_phrase", "ci-runner-7");
//!
//! let mut orchestrator = Orchestrator::new(config.clone());
//! let outcome = orchestrator
//!     .run(&inputs, |credentials| Services::connect(&config, credentials))
//!     .await?;
//! println!("{:?}", outcome);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod provider;
pub mod readiness;
pub mod registry;
pub mod remote;
pub mod request;
pub mod types;
pub mod workflow;

pub use config::{ProvisionerConfig, ReadinessConfig, SshConfig};
pub use error::{ProvisionError, ProvisionResult};
pub use provider::{LinodeProvider, VmProvider};
pub use readiness::{ReadinessProber, Sleeper, TokioSleeper};
pub use registry::{GitHubRegistry, RunnerRegistry, RunnerRemoval};
pub use remote::{RemoteShell, RemoteTarget, RunnerScript, SshShell};
pub use request::{Action, ApiCredentials, InputBag, ProvisionRequest};
pub use types::{InstanceId, RepoRef, RunnerSelector, Secret, VmInstance};
pub use workflow::{Orchestrator, ProvisionOutcome, Services, WorkflowState};
