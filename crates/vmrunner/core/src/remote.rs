//! Remote shell and runner configuration.
//!
//! `RemoteShell` is the black-box command channel to a VM. `SshShell` is the
//! production implementation that drives the system `ssh` client through
//! `sshpass`. `Configurator` runs the rendered [`RunnerScript`] over it.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::config::SshConfig;
use crate::error::{ProvisionError, ProvisionResult};
use crate::types::{RepoRef, Secret};

/// Captured output is cut to this many trailing bytes in error messages.
const MAX_CAPTURED_OUTPUT: usize = 4096;

/// Where and how to reach a VM.
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    pub address: String,
    pub user: String,
    pub password: Secret,
}

impl RemoteTarget {
    pub fn new(address: impl Into<String>, user: impl Into<String>, password: Secret) -> Self {
        Self {
            address: address.into(),
            user: user.into(),
            password,
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }
}

/// Result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Combined stdout and stderr, tail-truncated for error reporting.
    pub fn captured(&self) -> String {
        let mut combined = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&self.stderr);
        }
        tail(&combined, MAX_CAPTURED_OUTPUT)
    }
}

fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

/// Command execution channel to a VM.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `command` on the target. Errors mean the channel itself failed;
    /// a command that ran and exited non-zero is an `Ok` output.
    async fn exec(&self, target: &RemoteTarget, command: &str) -> ProvisionResult<CommandOutput>;
}

/// `ssh` driven through `sshpass -e`, so the password travels in the
/// environment instead of the argument list.
///
/// Host-key checking is off: the VM was just created and has no known
/// identity.
pub struct SshShell {
    config: SshConfig,
}

impl SshShell {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn ssh_args(&self, target: &RemoteTarget, command: &str) -> Vec<String> {
        vec![
            "-e".to_string(),
            "ssh".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            "PreferredAuthentications=password".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
            target.destination(),
            command.to_string(),
        ]
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    #[instrument(skip(self, target, command), fields(address = %target.address))]
    async fn exec(&self, target: &RemoteTarget, command: &str) -> ProvisionResult<CommandOutput> {
        let mut cmd = Command::new("sshpass");
        cmd.kill_on_drop(true)
            .args(self.ssh_args(target, command))
            .env("SSHPASS", target.password.expose())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let timeout = Duration::from_secs(self.config.command_timeout_secs);
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| ProvisionError::RemoteShell {
                address: target.address.clone(),
                reason: format!("command timed out after {}s", timeout.as_secs()),
            })?
            .map_err(|e| ProvisionError::RemoteShell {
                address: target.address.clone(),
                reason: format!("failed to spawn sshpass: {}", e),
            })?;

        let result = CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(exit_code = ?result.exit_code, "Remote command finished");
        Ok(result)
    }
}

/// The versioned runner bootstrap script.
const RUNNER_SCRIPT_TEMPLATE: &str = include_str!("../assets/configure-runner.sh");

/// Values substituted into the runner script.
#[derive(Debug, Clone)]
pub struct ScriptParams<'a> {
    pub repo: &'a RepoRef,
    pub token: &'a Secret,
    pub runner_name: &'a str,
    pub runner_label: &'a str,
    pub runner_version: &'a str,
}

/// A rendered runner script. Its text embeds the registration token, so
/// `Debug` does not print it.
pub struct RunnerScript(String);

impl std::fmt::Debug for RunnerScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RunnerScript({} bytes)", self.0.len())
    }
}

impl RunnerScript {
    /// Render the bundled template.
    pub fn render(params: &ScriptParams<'_>) -> ProvisionResult<Self> {
        Self::render_template(RUNNER_SCRIPT_TEMPLATE, params)
    }

    /// Render an arbitrary template with the same substitution points.
    ///
    /// Every value is shell single-quoted. A placeholder left over after
    /// substitution is an error.
    pub fn render_template(template: &str, params: &ScriptParams<'_>) -> ProvisionResult<Self> {
        let substitutions = [
            ("{{repo_url}}", params.repo.html_url()),
            ("{{token}}", params.token.expose().to_string()),
            ("{{runner_name}}", params.runner_name.to_string()),
            ("{{runner_label}}", params.runner_label.to_string()),
            ("{{runner_version}}", params.runner_version.to_string()),
        ];

        let mut rendered = template.to_string();
        for (placeholder, value) in &substitutions {
            rendered = rendered.replace(placeholder, &shell_quote(value));
        }

        if let Some(start) = rendered.find("{{") {
            let end = rendered[start..]
                .find("}}")
                .map(|i| start + i + 2)
                .unwrap_or(rendered.len());
            return Err(ProvisionError::Template(format!(
                "unknown placeholder {}",
                &rendered[start..end]
            )));
        }

        Ok(Self(rendered))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Quote a value for POSIX shells.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Runs the runner script on a VM.
pub struct Configurator<'a> {
    shell: &'a dyn RemoteShell,
}

impl<'a> Configurator<'a> {
    pub fn new(shell: &'a dyn RemoteShell) -> Self {
        Self { shell }
    }

    /// Execute `script` on `target`. Any failure, including the channel
    /// itself, is reported as a configuration failure with captured output.
    #[instrument(skip(self, target, script), fields(address = %target.address))]
    pub async fn configure(&self, target: &RemoteTarget, script: &RunnerScript) -> ProvisionResult<()> {
        let command = format!("bash -s <<'VMRUNNER_EOF'\n{}\nVMRUNNER_EOF", script.as_str());

        let output = match self.shell.exec(target, &command).await {
            Ok(output) => output,
            Err(e) => {
                return Err(ProvisionError::RemoteConfiguration {
                    address: target.address.clone(),
                    exit_code: None,
                    output: e.to_string(),
                })
            }
        };

        if !output.success() {
            return Err(ProvisionError::RemoteConfiguration {
                address: target.address.clone(),
                exit_code: output.exit_code,
                output: output.captured(),
            });
        }

        info!("Runner configured and started");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records commands and answers from a preset queue.
    struct ScriptedShell {
        responses: Mutex<Vec<ProvisionResult<CommandOutput>>>,
        commands: Mutex<Vec<String>>,
    }

    impl ScriptedShell {
        fn new(mut responses: Vec<ProvisionResult<CommandOutput>>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                commands: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RemoteShell for ScriptedShell {
        async fn exec(&self, _target: &RemoteTarget, command: &str) -> ProvisionResult<CommandOutput> {
            self.commands.lock().unwrap().push(command.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(CommandOutput { exit_code: Some(0), ..Default::default() }))
        }
    }

    fn target() -> RemoteTarget {
        RemoteTarget::new("192.0.2.10", "root", Secret::new("pw"))
    }

    fn params<'a>(repo: &'a RepoRef, token: &'a Secret) -> ScriptParams<'a> {
        ScriptParams {
            repo,
            token,
            runner_name: "ci-runner-ab12cd34",
            runner_label: "ci-runner",
            runner_version: "2.319.1",
        }
    }

    #[test]
    fn test_render_bundled_script() {
        let repo = RepoRef::new("acme", "widgets");
        let token = Secret::new("AABBCCDD");
        let script = RunnerScript::render(&params(&repo, &token)).unwrap();
        let text = script.as_str();

        assert!(text.contains("--url 'https://github.com/acme/widgets'"));
        assert!(text.contains("--token 'AABBCCDD'"));
        assert!(text.contains("--name 'ci-runner-ab12cd34'"));
        assert!(text.contains("--labels 'ci-runner'"));
        assert!(text.contains("RUNNER_VERSION='2.319.1'"));
        assert!(text.contains("nohup ./run.sh"));
        assert!(!text.contains("{{"));
    }

    #[test]
    fn test_render_quotes_values() {
        let repo = RepoRef::new("acme", "widgets");
        let token = Secret::new("a'b");
        let script =
            RunnerScript::render_template("x {{token}}", &params(&repo, &token)).unwrap();
        assert_eq!(script.as_str(), r"x 'a'\''b'");
    }

    #[test]
    fn test_render_rejects_unknown_placeholder() {
        let repo = RepoRef::new("acme", "widgets");
        let token = Secret::new("t");
        let err = RunnerScript::render_template("{{token}} {{region}}", &params(&repo, &token))
            .unwrap_err();
        assert_eq!(err.to_string(), "template error: unknown placeholder {{region}}");
    }

    #[test]
    fn test_script_debug_hides_token() {
        let repo = RepoRef::new("acme", "widgets");
        let token = Secret::new("AABBCCDD");
        let script = RunnerScript::render(&params(&repo, &token)).unwrap();
        assert!(!format!("{:?}", script).contains("AABBCCDD"));
    }

    #[test]
    fn test_ssh_args_disable_host_key_checks() {
        let shell = SshShell::new(SshConfig::default());
        let args = shell.ssh_args(&target(), "true");
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&"UserKnownHostsFile=/dev/null".to_string()));
        assert!(args.contains(&"root@192.0.2.10".to_string()));
        assert!(!args.iter().any(|a| a.contains("pw")));
        assert_eq!(args.last().map(String::as_str), Some("true"));
    }

    #[test]
    fn test_captured_output_is_truncated() {
        let output = CommandOutput {
            exit_code: Some(1),
            stdout: "x".repeat(MAX_CAPTURED_OUTPUT),
            stderr: "fatal: boom".into(),
        };
        let captured = output.captured();
        assert!(captured.starts_with("..."));
        assert!(captured.ends_with("fatal: boom"));
    }

    #[tokio::test]
    async fn test_configure_runs_script_once() {
        let shell = ScriptedShell::new(vec![]);
        let repo = RepoRef::new("acme", "widgets");
        let token = Secret::new("AABBCCDD");
        let script = RunnerScript::render(&params(&repo, &token)).unwrap();

        Configurator::new(&shell).configure(&target(), &script).await.unwrap();

        let commands = shell.commands.lock().unwrap();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].starts_with("bash -s <<'VMRUNNER_EOF'"));
        assert!(commands[0].contains("AABBCCDD"));
    }

    #[tokio::test]
    async fn test_configure_failure_carries_output() {
        let shell = ScriptedShell::new(vec![Ok(CommandOutput {
            exit_code: Some(2),
            stdout: String::new(),
            stderr: "config.sh: registration failed".into(),
        })]);
        let repo = RepoRef::new("acme", "widgets");
        let token = Secret::new("t");
        let script = RunnerScript::render(&params(&repo, &token)).unwrap();

        let err = Configurator::new(&shell)
            .configure(&target(), &script)
            .await
            .unwrap_err();
        match err {
            ProvisionError::RemoteConfiguration { exit_code, output, .. } => {
                assert_eq!(exit_code, Some(2));
                assert!(output.contains("registration failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_configure_channel_failure_is_configuration_error() {
        let shell = ScriptedShell::new(vec![Err(ProvisionError::RemoteShell {
            address: "192.0.2.10".into(),
            reason: "failed to spawn sshpass".into(),
        })]);
        let repo = RepoRef::new("acme", "widgets");
        let token = Secret::new("t");
        let script = RunnerScript::render(&params(&repo, &token)).unwrap();

        let err = Configurator::new(&shell)
            .configure(&target(), &script)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::RemoteConfiguration { exit_code: None, .. }));
    }
}
