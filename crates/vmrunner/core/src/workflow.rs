//! Workflow orchestrator.
//!
//! Sequences the create and destroy paths over the provider, registry and
//! remote shell capabilities, and owns the cleanup-on-failure policy:
//! once a VM id exists, a failed create never returns without trying to
//! delete that VM.
//!
//! ```text
//! Start → ValidatingInput → Creating   → Done
//!                         ↘ Destroying ↗    ↘ Failed
//! ```

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::config::ProvisionerConfig;
use crate::error::{ProvisionError, ProvisionResult};
use crate::provider::{instance_label, select_by_phrase, LinodeProvider, VmProvider};
use crate::readiness::{ReadinessProber, Sleeper, TokioSleeper};
use crate::registry::{GitHubRegistry, RunnerRegistry, RunnerRemoval};
use crate::remote::{
    Configurator, RemoteShell, RemoteTarget, RunnerScript, ScriptParams, SshShell,
};
use crate::request::{
    ActionParams, ApiCredentials, CreateParams, DestroyTarget, InputBag, ProvisionRequest,
    DEFAULT_RUNNER_LABEL,
};
use crate::types::{InstanceId, InstanceSpec, RepoRef, RunnerSelector};

/// Workflow states. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowState {
    Start,
    ValidatingInput,
    Creating,
    Destroying,
    Done,
    Failed { cause: String },
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Done | WorkflowState::Failed { .. })
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowState::Start => f.write_str("start"),
            WorkflowState::ValidatingInput => f.write_str("validating-input"),
            WorkflowState::Creating => f.write_str("creating"),
            WorkflowState::Destroying => f.write_str("destroying"),
            WorkflowState::Done => f.write_str("done"),
            WorkflowState::Failed { .. } => f.write_str("failed"),
        }
    }
}

/// Invocation outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ProvisionOutcome {
    Created {
        machine_id: String,
        machine_ip: String,
        runner_label: String,
    },
    Destroyed {
        machine_id: String,
    },
}

impl ProvisionOutcome {
    /// Outputs as `(name, value)` pairs. Only a successful create sets any.
    pub fn outputs(&self) -> Vec<(&'static str, &str)> {
        match self {
            ProvisionOutcome::Created {
                machine_id,
                machine_ip,
                runner_label,
            } => vec![
                ("machine_id", machine_id.as_str()),
                ("machine_ip", machine_ip.as_str()),
                ("runner_label", runner_label.as_str()),
            ],
            ProvisionOutcome::Destroyed { .. } => Vec::new(),
        }
    }
}

/// What cleanup needs to know about a half-finished create, captured when
/// the VM id first becomes known.
#[derive(Debug, Clone)]
struct CleanupContext {
    instance_id: InstanceId,
    repo: RepoRef,
    runner_label: String,
    /// The runner registers under the instance label.
    runner_name: String,
}

/// External capabilities the workflow runs against.
#[derive(Clone)]
pub struct Services {
    pub provider: Arc<dyn VmProvider>,
    pub registry: Arc<dyn RunnerRegistry>,
    pub shell: Arc<dyn RemoteShell>,
    pub sleeper: Arc<dyn Sleeper>,
}

impl Services {
    /// Production services: Linode, GitHub, ssh and the tokio timer.
    pub fn connect(config: &ProvisionerConfig, credentials: &ApiCredentials) -> ProvisionResult<Self> {
        Ok(Self {
            provider: Arc::new(LinodeProvider::new(
                &config.provider_endpoint,
                credentials.provider_token.clone(),
                config.http_timeout(),
            )?),
            registry: Arc::new(GitHubRegistry::new(
                &config.registry_endpoint,
                credentials.github_token.clone(),
                config.http_timeout(),
            )?),
            shell: Arc::new(SshShell::new(config.ssh.clone())),
            sleeper: Arc::new(TokioSleeper),
        })
    }
}

/// Per-invocation orchestrator.
pub struct Orchestrator {
    config: ProvisionerConfig,
    state: WorkflowState,
    history: Vec<WorkflowState>,
}

impl Orchestrator {
    pub fn new(config: ProvisionerConfig) -> Self {
        Self {
            config,
            state: WorkflowState::Start,
            history: vec![WorkflowState::Start],
        }
    }

    /// Current state.
    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// Every state visited, in order.
    pub fn history(&self) -> &[WorkflowState] {
        &self.history
    }

    fn transition(&mut self, next: WorkflowState) {
        match &next {
            WorkflowState::Failed { cause } => {
                error!(from = %self.state, %cause, "Workflow failed")
            }
            _ => info!(from = %self.state, to = %next, "Workflow transition"),
        }
        self.history.push(next.clone());
        self.state = next;
    }

    fn finish(&mut self, result: ProvisionResult<ProvisionOutcome>) -> ProvisionResult<ProvisionOutcome> {
        match &result {
            Ok(_) => self.transition(WorkflowState::Done),
            Err(e) => self.transition(WorkflowState::Failed {
                cause: e.to_string(),
            }),
        }
        result
    }

    /// Validate `inputs`, build the services with the validated credentials
    /// and run the requested action.
    pub async fn run<F>(&mut self, inputs: &InputBag, connect: F) -> ProvisionResult<ProvisionOutcome>
    where
        F: FnOnce(&ApiCredentials) -> ProvisionResult<Services>,
    {
        self.transition(WorkflowState::ValidatingInput);
        let request = match ProvisionRequest::resolve(inputs, &self.config) {
            Ok(request) => request,
            Err(e) => return self.finish(Err(e)),
        };
        let services = match connect(&request.credentials) {
            Ok(services) => services,
            Err(e) => return self.finish(Err(e)),
        };
        self.execute(&services, request).await
    }

    /// Run an already validated request.
    pub async fn execute(
        &mut self,
        services: &Services,
        request: ProvisionRequest,
    ) -> ProvisionResult<ProvisionOutcome> {
        let ProvisionRequest {
            repo,
            runner_label,
            params,
            ..
        } = request;

        let result = match params {
            ActionParams::Create(params) => {
                self.transition(WorkflowState::Creating);
                self.steps(services).create(&repo, &runner_label, params).await
            }
            ActionParams::Destroy(target) => {
                self.transition(WorkflowState::Destroying);
                self.steps(services).destroy(&repo, &runner_label, target).await
            }
        };
        self.finish(result)
    }

    fn steps<'a>(&'a self, services: &'a Services) -> Steps<'a> {
        Steps {
            services,
            config: &self.config,
        }
    }
}

/// The workflow steps, borrowed from one invocation.
struct Steps<'a> {
    services: &'a Services,
    config: &'a ProvisionerConfig,
}

impl Steps<'_> {
    #[instrument(skip(self, repo, params), fields(repo = %repo))]
    async fn create(
        &self,
        repo: &RepoRef,
        runner_label: &str,
        params: CreateParams,
    ) -> ProvisionResult<ProvisionOutcome> {
        let spec = InstanceSpec {
            sizing: params.sizing,
            root_password: params.root_password,
            label: instance_label(runner_label),
            tags: params.tags,
        };

        let instance = self.services.provider.create_instance(&spec).await?;
        let cleanup = CleanupContext {
            instance_id: instance.id.clone(),
            repo: repo.clone(),
            runner_label: runner_label.to_string(),
            runner_name: spec.label.clone(),
        };

        match self.configure_instance(&instance.id, instance.address.as_deref(), &spec, &cleanup).await {
            Ok(address) => Ok(ProvisionOutcome::Created {
                machine_id: instance.id.to_string(),
                machine_ip: address,
                runner_label: runner_label.to_string(),
            }),
            Err(e) => {
                if e.triggers_cleanup() {
                    self.cleanup(&cleanup).await;
                }
                Err(e)
            }
        }
    }

    /// Steps between instance creation and a running runner. Returns the
    /// address the runner was configured at.
    async fn configure_instance(
        &self,
        id: &InstanceId,
        address: Option<&str>,
        spec: &InstanceSpec,
        ctx: &CleanupContext,
    ) -> ProvisionResult<String> {
        let address = match address {
            Some(address) => address.to_string(),
            None => self.lookup_address(id).await?,
        };
        let target = RemoteTarget::new(
            address.clone(),
            self.config.ssh.user.clone(),
            spec.root_password.clone(),
        );

        ReadinessProber::new(
            self.services.shell.as_ref(),
            self.services.sleeper.as_ref(),
            &self.config.readiness,
        )
        .wait_ready(&target)
        .await?;

        let credential = self
            .services
            .registry
            .mint_registration_token(&ctx.repo)
            .await?;
        let script = RunnerScript::render(&ScriptParams {
            repo: &ctx.repo,
            token: &credential.token,
            runner_name: &ctx.runner_name,
            runner_label: &ctx.runner_label,
            runner_version: &self.config.runner_version,
        })?;

        Configurator::new(self.services.shell.as_ref())
            .configure(&target, &script)
            .await?;

        Ok(address)
    }

    /// The create response may come back before an address is assigned.
    async fn lookup_address(&self, id: &InstanceId) -> ProvisionResult<String> {
        self.services
            .provider
            .list_instances()
            .await?
            .into_iter()
            .find(|vm| &vm.id == id)
            .and_then(|vm| vm.address)
            .ok_or_else(|| ProvisionError::AddressUnavailable {
                instance_id: id.to_string(),
            })
    }

    /// Best-effort teardown after a failed create. Never fails; the caller
    /// reports the original error.
    async fn cleanup(&self, ctx: &CleanupContext) {
        warn!(instance_id = %ctx.instance_id, "Create failed; cleaning up instance");
        self.unregister(&ctx.repo, &RunnerSelector::Name(ctx.runner_name.clone()))
            .await;
        if let Err(e) = self.services.provider.delete_instance(&ctx.instance_id).await {
            error!(instance_id = %ctx.instance_id, error = %e, "Cleanup could not delete instance");
        }
    }

    #[instrument(skip(self, repo, target), fields(repo = %repo))]
    async fn destroy(
        &self,
        repo: &RepoRef,
        runner_label: &str,
        target: DestroyTarget,
    ) -> ProvisionResult<ProvisionOutcome> {
        let (instance_id, runner) = match target {
            DestroyTarget::Id(id) => {
                let runner = self.runner_for_instance(&id, runner_label).await;
                (id, runner)
            }
            DestroyTarget::Phrase(phrase) => {
                let instances = self.services.provider.list_instances().await?;
                let selected = select_by_phrase(instances, &phrase)?;
                info!(instance_id = %selected.id, label = %selected.label, %phrase, "Resolved search phrase");
                (selected.id, Some(RunnerSelector::Name(selected.label)))
            }
        };

        if let Some(runner) = runner {
            self.unregister(repo, &runner).await;
        }
        self.services.provider.delete_instance(&instance_id).await?;

        Ok(ProvisionOutcome::Destroyed {
            machine_id: instance_id.to_string(),
        })
    }

    /// Which runner to remove when destroying instance `id`.
    ///
    /// Runners are named after their instance label. If the instance is not
    /// listed, fall back to `runner_label` unless it is the label every
    /// self-hosted runner carries.
    async fn runner_for_instance(&self, id: &InstanceId, runner_label: &str) -> Option<RunnerSelector> {
        match self.services.provider.list_instances().await {
            Ok(instances) => {
                if let Some(vm) = instances.into_iter().find(|vm| &vm.id == id) {
                    return Some(RunnerSelector::Name(vm.label));
                }
            }
            Err(e) => warn!(instance_id = %id, error = %e, "Instance lookup failed"),
        }

        if runner_label == DEFAULT_RUNNER_LABEL {
            warn!(instance_id = %id, "Instance label unknown; skipping unregistration");
            None
        } else {
            Some(RunnerSelector::Label(runner_label.to_string()))
        }
    }

    /// Remove the runner registration matching `selector`, if there is one.
    /// Every failure is logged and swallowed.
    async fn unregister(&self, repo: &RepoRef, selector: &RunnerSelector) {
        let runner = match self.services.registry.find_runner(repo, selector).await {
            Ok(Some(runner)) => runner,
            Ok(None) => {
                info!(%selector, "No runner registration to remove");
                return;
            }
            Err(e) => {
                warn!(%selector, error = %e, "Runner lookup failed; skipping unregistration");
                return;
            }
        };

        match self.services.registry.delete_runner(repo, runner.id).await {
            Ok(RunnerRemoval::Removed) => {}
            Ok(RunnerRemoval::AlreadyGone) => {
                warn!(runner_id = runner.id, "Runner was already unregistered")
            }
            Ok(RunnerRemoval::Failed { status, .. }) => {
                warn!(runner_id = runner.id, status, "Runner unregistration failed; continuing")
            }
            Err(e) => warn!(runner_id = runner.id, error = %e, "Runner unregistration failed; continuing"),
        }
    }
}
