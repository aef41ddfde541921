use super::types::*;
use crate::config::{env_var_pattern, expand_env_vars, expand_tilde};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml_string = fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })
}

/// Parse and validate a YAML config string
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    // Expand environment variables in the YAML string before parsing
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;
    expand_paths(&mut config);
    validate_config(&config)?;

    Ok(config)
}

/// Checks for unexpanded environment variables and returns a helpful error
fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let mut unexpanded_vars: Vec<String> = env_var_pattern()
        .captures_iter(yaml_string)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort();
    unexpanded_vars.dedup();

    let error_msg = if unexpanded_vars.len() == 1 {
        format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with an actual value",
            unexpanded_vars[0]
        )
    } else {
        format!(
            "Environment variables are not set: {}\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variables\n\
             2. Replace the variables in the config file with actual values",
            unexpanded_vars.join(", ")
        )
    };

    Err(ConfigError::Validation(error_msg))
}

/// Expands tilde (~) in all PathBuf fields in the config.
fn expand_paths(config: &mut Config) {
    if let Some(path) = config.storage.path.as_mut() {
        *path = expand_tilde(path);
    }
    if let Some(path) = config.storage.settings_path.as_mut() {
        *path = expand_tilde(path);
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    validate_ingestion(&config.ingestion, &mut errors);

    if config.channels.is_empty() {
        errors.push("channels must contain at least one channel".to_string());
    }

    let mut group_ids = HashSet::new();
    for (i, channel) in config.channels.iter().enumerate() {
        if let Err(e) = channel.validate() {
            errors.push(format!("channels[{}]: {}", i, e));
        }
        if !channel.group_id.is_empty() && !group_ids.insert(channel.group_id.as_str()) {
            errors.push(format!(
                "channels[{}]: duplicate group id '{}'",
                i, channel.group_id
            ));
        }
    }

    if config.storage.max_records == Some(0) {
        errors.push("storage.max_records must be greater than 0".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_ingestion(ingestion: &IngestionConfig, errors: &mut Vec<String>) {
    if ingestion.url.is_empty() {
        errors.push("ingestion.url cannot be empty".to_string());
    } else if !ingestion.url.starts_with("http://") && !ingestion.url.starts_with("https://") {
        errors.push(format!(
            "ingestion.url must start with http:// or https://, got '{}'",
            ingestion.url
        ));
    }

    if ingestion.timeout.is_zero() {
        errors.push("ingestion.timeout must be greater than 0".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpanded_var_is_reported() {
        let yaml = "ingestion:\n  url: $env{COURIER_SURELY_UNSET_URL}\nchannels: []\n";
        match parse_config(yaml) {
            Err(ConfigError::Validation(msg)) => {
                assert!(msg.contains("COURIER_SURELY_UNSET_URL"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let yaml = r#"
ingestion:
  url: ftp://nope
channels:
  - group_id: a
    batch_size_limit: 0
    pending_batches_limit: 1
    flush_interval: 1s
  - group_id: a
    batch_size_limit: 1
    pending_batches_limit: 1
    flush_interval: 1s
"#;
        match parse_config(yaml) {
            Err(ConfigError::ValidationList(errors)) => {
                assert_eq!(errors.len(), 3, "{:?}", errors);
                assert!(errors.iter().any(|e| e.contains("ingestion.url")));
                assert!(errors.iter().any(|e| e.contains("batch_size_limit")));
                assert!(errors.iter().any(|e| e.contains("duplicate group id 'a'")));
            }
            other => panic!("expected validation list, got {:?}", other),
        }
    }
}
