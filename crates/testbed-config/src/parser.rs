//! Configuration parser with environment variable substitution

use crate::{Config, ConfigError, HypervisorConfig, Result};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([^}]+)\}").expect("environment variable pattern is valid")
});

/// Parse a YAML configuration file
pub fn parse_file(path: impl AsRef<Path>) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    parse_str(&content)
}

/// Parse YAML configuration from a string
///
/// Environment variables are substituted before the document is parsed.
pub fn parse_str(content: &str) -> Result<Config> {
    let substituted = substitute_env_vars(content)?;
    let config: Config = serde_yaml::from_str(&substituted)?;
    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration
fn validate_config(config: &Config) -> Result<()> {
    if config.version != "1.0" {
        return Err(ConfigError::ValidationError(format!(
            "Unsupported version: {}, expected 1.0",
            config.version
        )));
    }

    validate_provider(&config.provider)
}

/// Validate hypervisor settings
pub fn validate_provider(provider: &HypervisorConfig) -> Result<()> {
    if provider.images.is_empty() {
        return Err(ConfigError::ValidationError(
            "at least one distribution image must be registered".to_string(),
        ));
    }

    if provider.initial_machine_id == 0 {
        return Err(ConfigError::ValidationError(
            "initial_machine_id must be strictly positive".to_string(),
        ));
    }

    if provider.management.bridge.is_empty() {
        return Err(ConfigError::ValidationError(
            "management bridge must not be empty".to_string(),
        ));
    }

    if provider.bridges.prefix.is_empty() {
        return Err(ConfigError::ValidationError(
            "bridge prefix must not be empty".to_string(),
        ));
    }

    if provider.max_interfaces == 0 {
        return Err(ConfigError::ValidationError(
            "max_interfaces must allow the management interface".to_string(),
        ));
    }

    if provider.timeouts.task_poll_ms == 0 || provider.timeouts.ssh_poll_ms == 0 {
        return Err(ConfigError::ValidationError(
            "poll intervals must be non-zero".to_string(),
        ));
    }

    Ok(())
}

/// Substitute environment variables in a string
///
/// Supports `${VAR}` and `${VAR:-default}`.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let mut errors = Vec::new();

    for cap in ENV_VAR.captures_iter(input) {
        let full_match = &cap[0];
        let var_expr = &cap[1];

        // Handle default values: ${VAR:-default}
        let (var_name, default_value) = match var_expr.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (var_expr, None),
        };

        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(full_match, &value);
            }
            Err(_) => match default_value {
                Some(default) => result = result.replace(full_match, default),
                None => errors.push(var_name.to_string()),
            },
        }
    }

    if !errors.is_empty() {
        return Err(ConfigError::EnvVarNotFound(errors.join(", ")));
    }

    Ok(result)
}
