use std::path::Path;

use anyhow::{Context, Result};
use teleconsult_protocol::ClientConfig;

/// Load configuration from a TOML file at the given path.
/// If the file doesn't exist, returns default configuration.
pub fn load_config(path: &Path) -> Result<ClientConfig> {
    if !path.exists() {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(ClientConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ClientConfig =
        toml::from_str(&contents).with_context(|| "Failed to parse config TOML")?;

    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Log every validation issue; fail if any of them is an error.
pub fn check(config: &ClientConfig) -> Result<()> {
    let Err(issues) = config.validate() else {
        return Ok(());
    };
    let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
    for issue in &issues {
        if issue.starts_with("ERROR:") {
            tracing::error!("{}", issue);
        } else {
            tracing::warn!("{}", issue);
        }
    }
    if has_errors {
        anyhow::bail!("Invalid configuration");
    }
    Ok(())
}
