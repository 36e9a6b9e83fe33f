//! Output reporting utilities

use crate::error::CliResult;
use colored::*;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use vmrunner_core::ProvisionOutcome;

/// Output format for the invocation outcome
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// `key=value` lines
    #[default]
    Text,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
}

/// Render the outcome in the specified format
pub fn render_outcome(outcome: &ProvisionOutcome, format: OutputFormat) -> CliResult<String> {
    let rendered = match format {
        OutputFormat::Text => match outcome {
            ProvisionOutcome::Created { .. } => outcome
                .outputs()
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect::<Vec<_>>()
                .join("\n"),
            ProvisionOutcome::Destroyed { machine_id } => format!("destroyed={}", machine_id),
        },
        OutputFormat::Json => serde_json::to_string_pretty(outcome)?,
        OutputFormat::Yaml => serde_yaml::to_string(outcome)?.trim_end().to_string(),
    };
    Ok(rendered)
}

/// Append the outcome's outputs to a GitHub Actions output file
pub fn write_step_outputs(path: &Path, outcome: &ProvisionOutcome) -> CliResult<()> {
    let outputs = outcome.outputs();
    if outputs.is_empty() {
        return Ok(());
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for (key, value) in outputs {
        writeln!(file, "{}={}", key, value)?;
    }
    Ok(())
}

/// Workflow-command annotation that marks the step failed with `message`
pub fn error_annotation(message: &str) -> String {
    // Workflow commands end at the first newline; escape per the runner's rules.
    let escaped = message
        .replace('%', "%25")
        .replace('\r', "%0D")
        .replace('\n', "%0A");
    format!("::error::{}", escaped)
}

/// Print a success message
pub fn print_success(message: &str) {
    eprintln!("{} {}", "✓".green(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red(), message);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created() -> ProvisionOutcome {
        ProvisionOutcome::Created {
            machine_id: "4242".into(),
            machine_ip: "192.0.2.10".into(),
            runner_label: "ci-runner-7".into(),
        }
    }

    #[test]
    fn test_output_format_default() {
        let format = OutputFormat::default();
        assert!(matches!(format, OutputFormat::Text));
    }

    #[test]
    fn test_render_text() {
        let text = render_outcome(&created(), OutputFormat::Text).unwrap();
        assert_eq!(
            text,
            "machine_id=4242\nmachine_ip=192.0.2.10\nrunner_label=ci-runner-7"
        );
    }

    #[test]
    fn test_render_json() {
        let json = render_outcome(&created(), OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["action"], "created");
        assert_eq!(value["machine_ip"], "192.0.2.10");
    }

    #[test]
    fn test_write_step_outputs_appends() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "previous=1\n").unwrap();

        write_step_outputs(file.path(), &created()).unwrap();

        let contents = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(
            contents,
            "previous=1\nmachine_id=4242\nmachine_ip=192.0.2.10\nrunner_label=ci-runner-7\n"
        );
    }

    #[test]
    fn test_destroy_writes_no_outputs() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let outcome = ProvisionOutcome::Destroyed {
            machine_id: "4242".into(),
        };

        write_step_outputs(file.path(), &outcome).unwrap();
        assert!(std::fs::read_to_string(file.path()).unwrap().is_empty());
    }

    #[test]
    fn test_error_annotation_escapes_newlines() {
        assert_eq!(
            error_annotation("line one\nline two 100%"),
            "::error::line one%0Aline two 100%25"
        );
    }
}
