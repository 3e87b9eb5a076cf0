use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::AgentConfig;

/// Prefix of environment overrides, e.g. `FNAGENT_ROUND_TRIP__MAX_RETRIES=3`.
pub const ENV_PREFIX: &str = "FNAGENT";

/// Load configuration from an optional file plus `FNAGENT_*` environment overrides.
/// Supports YAML, JSON, TOML and INI files.
pub async fn load_config(config_path: Option<&Path>) -> Result<AgentConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: Option<&Path>) -> Result<AgentConfig> {
    load_with_environment(config_path, environment())
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

fn file_format(path: &Path) -> FileFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Toml,
    }
}

fn load_with_environment(config_path: Option<&Path>, env: Environment) -> Result<AgentConfig> {
    let mut builder = Config::builder();
    if let Some(path) = config_path {
        let name = path
            .to_str()
            .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", path.display()))?;
        builder = builder.add_source(File::new(name, file_format(path)));
    }

    let source_desc = config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "environment".to_string());

    let settings = builder
        .add_source(env)
        .build()
        .with_context(|| format!("Failed to build config from {source_desc}"))?;

    settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize config from {source_desc}"))
}
