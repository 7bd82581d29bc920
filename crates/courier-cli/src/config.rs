//! CLI configuration: `~/.courier/config.toml`.

use anyhow::Context;
use courier_types::config::ChannelConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable read for the bot token when the config names none.
pub const DEFAULT_CREDENTIAL_ENV: &str = "TELEGRAM_BOT_TOKEN";

/// Top-level config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub log: LogConfig,
    /// Raw `[telegram]` table; validated by `ChannelConfig::from_value`.
    pub telegram: toml::Table,
    /// File the settings were read from; `None` when defaults were used.
    #[serde(skip)]
    pub source: Option<PathBuf>,
    #[serde(skip)]
    searched: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON log lines instead of text.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// `~/.courier/config.toml`, or `./config.toml` without a home directory.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".courier"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("config.toml")
}

/// Load the config file. A missing file yields defaults; a malformed one is
/// an error.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<CliConfig> {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        return Ok(CliConfig {
            searched: config_path,
            ..CliConfig::default()
        });
    }

    let contents = std::fs::read_to_string(&config_path)
        .with_context(|| format!("reading {}", config_path.display()))?;
    let mut config: CliConfig = toml::from_str(&contents)
        .with_context(|| format!("parsing {}", config_path.display()))?;
    config.source = Some(config_path.clone());
    config.searched = config_path;
    Ok(config)
}

impl CliConfig {
    /// Report where settings came from. Called once tracing is installed,
    /// since the log settings themselves live in the file.
    pub fn log_source(&self) {
        match &self.source {
            Some(path) => info!(path = %path.display(), "Loaded configuration"),
            None => info!(path = %self.searched.display(), "Config file not found, using defaults"),
        }
    }

    /// Build the channel config from `[telegram]`, resolving the credential
    /// through `lookup_env` when the table has no `credential` key.
    pub fn channel_config<F>(&self, lookup_env: F) -> anyhow::Result<ChannelConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut table = self.telegram.clone();
        let env_name = match table.remove("credential_env") {
            Some(toml::Value::String(name)) => name,
            Some(other) => anyhow::bail!("[telegram] credential_env must be a string, got {other}"),
            None => DEFAULT_CREDENTIAL_ENV.to_string(),
        };
        if !table.contains_key("credential") {
            let token = lookup_env(&env_name).with_context(|| {
                format!("no bot token: set ${env_name} or [telegram] credential")
            })?;
            table.insert("credential".to_string(), toml::Value::String(token));
        }

        let value = serde_json::to_value(&table).context("converting [telegram] table")?;
        ChannelConfig::from_value(&value).context("invalid [telegram] configuration")
    }
}
