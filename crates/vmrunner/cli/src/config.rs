//! CLI configuration

use crate::error::{CliError, CliResult};
use std::path::PathBuf;
use tracing::debug;
use vmrunner_core::ProvisionerConfig;

/// Load provisioner configuration from file.
///
/// Without an explicit path the platform config directory is used. A
/// missing file yields the defaults.
pub fn load(path: Option<&str>) -> CliResult<ProvisionerConfig> {
    let config_path = match path {
        Some(p) => PathBuf::from(p),
        None => default_config_path()?,
    };

    if config_path.exists() {
        let contents = std::fs::read_to_string(&config_path)?;
        let config: ProvisionerConfig = toml::from_str(&contents)
            .map_err(|e| CliError::Config(format!("{}: {}", config_path.display(), e)))?;
        debug!(path = %config_path.display(), "Loaded configuration");
        Ok(config)
    } else {
        debug!(path = %config_path.display(), "No configuration file; using defaults");
        Ok(ProvisionerConfig::default())
    }
}

/// Get the default configuration file path
fn default_config_path() -> CliResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| CliError::Config("Cannot find config directory".into()))?;
    Ok(config_dir.join("vmrunner").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_missing_config() {
        // Should return default config when file doesn't exist
        let config = load(Some("/nonexistent/path/config.toml")).unwrap();
        assert_eq!(config, ProvisionerConfig::default());
    }

    #[test]
    fn test_load_partial_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
provider_endpoint = "http://127.0.0.1:9000/v4"
default_region = "eu-central"

[readiness]
max_attempts = 3
interval_secs = 5
"#
        )
        .unwrap();

        let config = load(file.path().to_str()).unwrap();
        assert_eq!(config.provider_endpoint, "http://127.0.0.1:9000/v4");
        assert_eq!(config.default_region, "eu-central");
        assert_eq!(config.readiness.max_attempts, 3);
        assert_eq!(config.ssh.user, "root");
    }

    #[test]
    fn test_load_invalid_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "readiness = 12").unwrap();

        let err = load(file.path().to_str()).unwrap_err();
        assert!(matches!(err, CliError::Config(_)));
    }
}
