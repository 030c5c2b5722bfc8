//! Engine configuration loader.
//!
//! Reads `weaver.toml` from a directory and deserializes it into
//! [`EngineConfig`]. Every field has a default, so a partial file is fine.

use std::path::Path;

use weaver_types::config::EngineConfig;

/// File name looked up by [`load_engine_config`].
pub const CONFIG_FILE_NAME: &str = "weaver.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse {CONFIG_FILE_NAME}: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Parse and validate a config document.
pub fn parse_engine_config(content: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.max_concurrent_nodes == 0 {
        return Err(ConfigError::Invalid("max_concurrent_nodes must be at least 1".to_string()));
    }
    if config.default_max_iterations == 0 {
        return Err(ConfigError::Invalid("default_max_iterations must be at least 1".to_string()));
    }
    if config.event_buffer == 0 {
        return Err(ConfigError::Invalid("event_buffer must be at least 1".to_string()));
    }
    if !(config.credits.estimate_margin >= 1.0) {
        return Err(ConfigError::Invalid(format!(
            "credits.estimate_margin must be >= 1.0, got {}",
            config.credits.estimate_margin
        )));
    }
    Ok(())
}

/// Load engine configuration from `{dir}/weaver.toml`.
///
/// - Missing file: defaults.
/// - Unreadable, unparseable, or invalid file: logs a warning, defaults.
pub async fn load_engine_config(dir: &Path) -> EngineConfig {
    let config_path = dir.join(CONFIG_FILE_NAME);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE_NAME} found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match parse_engine_config(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("{}: {err}, using defaults", config_path.display());
            EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_concurrent_nodes, 10);
    }

    #[tokio::test]
    async fn partial_file_keeps_other_defaults() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            r#"
max_concurrent_nodes = 4
execution_timeout_ms = 60000

[credits]
enabled = false

[credits.node_costs]
http = 3

[[credits.llm_pricing]]
model_pattern = "claude-sonnet-4"
input_cost_per_million = 3.0
output_cost_per_million = 15.0
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_concurrent_nodes, 4);
        assert_eq!(config.execution_timeout_ms, 60_000);
        assert_eq!(config.default_node_timeout_ms, 300_000);
        assert!(!config.credits.enabled);
        assert_eq!(config.credits.node_costs["http"], 3);
        assert_eq!(config.credits.llm_pricing[0].model_pattern, "claude-sonnet-4");
    }

    #[tokio::test]
    async fn invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE_NAME), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn zero_concurrency_rejected() {
        let err = parse_engine_config("max_concurrent_nodes = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = parse_engine_config("[credits]\nestimate_margin = 0.5").unwrap_err();
        assert!(err.to_string().contains("estimate_margin"));
    }
}
