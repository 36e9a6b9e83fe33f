//! vmrunner CLI - Ephemeral VM-backed CI runners
//!
//! One invocation performs one action against a repository:
//! - `create`: provision a VM and register it as a self-hosted runner
//! - `destroy`: unregister the runner and delete its VM
//!
//! Every input can be given as a flag or through the `INPUT_*` environment
//! variables a GitHub Actions step exports for its `with:` block.

use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vmrunner_core::{InputBag, Orchestrator, ProvisionOutcome, Services};

mod config;
mod error;
pub mod output;

pub use error::{CliError, CliResult};

/// vmrunner CLI application
#[derive(Parser, Debug)]
#[command(name = "vmrunner")]
#[command(about = "Create and destroy ephemeral VM-backed CI runners", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "VMRUNNER_CONFIG")]
    config: Option<String>,

    /// Output format (text, json, yaml)
    #[arg(short, long, default_value = "text")]
    output: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Action to perform (create, destroy)
    #[arg(long, env = "INPUT_ACTION")]
    action: Option<String>,

    /// GitHub token allowed to manage the repository's runners
    #[arg(long, env = "INPUT_GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    /// Linode API token (falls back to LINODE_TOKEN)
    #[arg(long, env = "INPUT_LINODE_TOKEN", hide_env_values = true)]
    linode_token: Option<String>,

    /// Id of the machine to destroy
    #[arg(long, env = "INPUT_MACHINE_ID")]
    machine_id: Option<String>,

    /// Label or tag fragment identifying the machine to destroy
    #[arg(long, env = "INPUT_SEARCH_PHRASE")]
    search_phrase: Option<String>,

    /// Runner label
    #[arg(long, env = "INPUT_RUNNER_LABEL")]
    runner_label: Option<String>,

    /// Root password for the new machine (generated when omitted)
    #[arg(long, env = "INPUT_ROOT_PASSWORD", hide_env_values = true)]
    root_password: Option<String>,

    /// Machine type, e.g. g6-standard-2
    #[arg(long, env = "INPUT_MACHINE_TYPE")]
    machine_type: Option<String>,

    /// Machine image, e.g. linode/ubuntu22.04
    #[arg(long, env = "INPUT_IMAGE")]
    image: Option<String>,

    /// Region for the new machine
    #[arg(long, env = "INPUT_REGION")]
    region: Option<String>,

    /// Comma-separated tags for the new machine
    #[arg(long, env = "INPUT_TAGS")]
    tags: Option<String>,

    /// Repository owner
    #[arg(long, env = "INPUT_ORGANIZATION")]
    organization: Option<String>,

    /// Repository name
    #[arg(long, env = "INPUT_REPO_NAME")]
    repo_name: Option<String>,
}

impl Cli {
    /// Collect the action inputs into a configuration bag.
    fn inputs(&self) -> InputBag {
        let linode_token = self
            .linode_token
            .clone()
            .or_else(|| std::env::var("LINODE_TOKEN").ok());

        [
            ("action", self.action.clone()),
            ("github_token", self.github_token.clone()),
            ("linode_token", linode_token),
            ("machine_id", self.machine_id.clone()),
            ("search_phrase", self.search_phrase.clone()),
            ("runner_label", self.runner_label.clone()),
            ("root_password", self.root_password.clone()),
            ("machine_type", self.machine_type.clone()),
            ("image", self.image.clone()),
            ("region", self.region.clone()),
            ("tags", self.tags.clone()),
            ("organization", self.organization.clone()),
            ("repo_name", self.repo_name.clone()),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key.to_string(), v)))
        .collect()
    }
}

/// Run using the current process arguments.
pub async fn run() -> CliResult<()> {
    run_with_args(std::env::args_os()).await
}

/// Run using the provided argument iterator.
pub async fn run_with_args<I, T>(args: I) -> CliResult<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .without_time(),
        )
        .init();

    // Load config
    let config = config::load(cli.config.as_deref())?;
    let inputs = cli.inputs();

    let mut orchestrator = Orchestrator::new(config.clone());
    let outcome = orchestrator
        .run(&inputs, |credentials| Services::connect(&config, credentials))
        .await?;

    report(&outcome, cli.output)
}

fn report(outcome: &ProvisionOutcome, format: output::OutputFormat) -> CliResult<()> {
    if let Some(path) = std::env::var_os("GITHUB_OUTPUT").filter(|p| !p.is_empty()) {
        output::write_step_outputs(&PathBuf::from(path), outcome)?;
    }

    match outcome {
        ProvisionOutcome::Created {
            machine_id,
            runner_label,
            ..
        } => output::print_success(&format!(
            "Runner '{}' is online on machine {}",
            runner_label, machine_id
        )),
        ProvisionOutcome::Destroyed { machine_id } => {
            output::print_success(&format!("Machine {} destroyed", machine_id))
        }
    }

    println!("{}", output::render_outcome(outcome, format)?);
    Ok(())
}
