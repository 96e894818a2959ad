use std::path::Path;

use crate::config::schema::{Config, TargetConfig};
use crate::coordinator::TARGETS_PER_REQUEST;
use crate::error::ConfigError;
use crate::report::TargetKind;

const SCHEMA_JSON: &str = include_str!("../../schema/config-v1.json");

/// Loads a config file. `.yaml`/`.yml` files are read as YAML, anything
/// else as JSON.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => load_config_from_yaml_str(&content),
        _ => load_config_from_str(&content),
    }
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;
    load_config_from_value(json_value)
}

pub fn load_config_from_yaml_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_yaml::from_str(content)?;
    load_config_from_value(json_value)
}

fn load_config_from_value(json_value: serde_json::Value) -> Result<Config, ConfigError> {
    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    for kind in TargetKind::ALL {
        validate_target(kind, config.targets.get(kind))?;
    }

    if config.dispatch.target_timeout_secs == 0 {
        return Err(ConfigError::Validation {
            message: "dispatch.target_timeout_secs must be positive".to_string(),
        });
    }
    if config.dispatch.worker_count < TARGETS_PER_REQUEST as usize {
        return Err(ConfigError::Validation {
            message: format!(
                "dispatch.worker_count must be at least {} so both targets of a request run together",
                TARGETS_PER_REQUEST
            ),
        });
    }
    if config.dispatch.channel_capacity == 0 {
        return Err(ConfigError::Validation {
            message: "dispatch.channel_capacity must be positive".to_string(),
        });
    }
    if config.pending.timeout_secs == Some(0) || config.pending.sweep_interval_secs == 0 {
        return Err(ConfigError::Validation {
            message: "pending.timeout_secs and pending.sweep_interval_secs must be positive"
                .to_string(),
        });
    }
    if let Some(pending) = config.pending.timeout_secs {
        if pending <= config.dispatch.target_timeout_secs {
            return Err(ConfigError::Validation {
                message: format!(
                    "pending.timeout_secs ({}) must exceed dispatch.target_timeout_secs ({})",
                    pending, config.dispatch.target_timeout_secs
                ),
            });
        }
    }

    if let Some(webhook) = &config.notification.webhook {
        if !is_http_url(&webhook.url) {
            return Err(ConfigError::Validation {
                message: format!("Webhook URL must be http(s): {}", webhook.url),
            });
        }
    }

    Ok(())
}

fn validate_target(kind: TargetKind, target: &TargetConfig) -> Result<(), ConfigError> {
    if !is_http_url(&target.base_url) {
        return Err(ConfigError::InvalidTarget {
            kind,
            reason: format!("base_url must be an http(s) URL, got '{}'", target.base_url),
        });
    }
    if !target.path_for(kind).starts_with('/') {
        return Err(ConfigError::InvalidTarget {
            kind,
            reason: "path must start with '/'".to_string(),
        });
    }
    Ok(())
}

fn is_http_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));
    rest.is_some_and(|host| !host.is_empty())
}
