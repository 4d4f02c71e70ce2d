//! Configuration management for Strata.
//!
//! Loads configuration from ${STRATA_HOME}/config.toml with sensible defaults.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::services::ServiceSettings;

/// Settings forwarded to the remote services.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Model used by the graph proposal service.
    pub proposal_model: Option<String>,
    /// Model used by the validation service.
    pub validation_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub auto_grow_graph: bool,
    pub validate_answers: bool,
    pub deep_research: bool,
    pub persist_debounce_ms: u64,
    pub services: ServicesConfig,
}

/// Returns the default config template with comments.
///
/// This is embedded from default_config.toml at compile time.
fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

pub mod paths {
    //! Path resolution for Strata configuration.
    //!
    //! STRATA_HOME resolution order:
    //! 1. STRATA_HOME environment variable (if set)
    //! 2. ~/.config/strata (default)
    //! 3. ./.strata when no home directory is known

    use std::path::PathBuf;

    /// Returns the Strata home directory.
    pub fn strata_home() -> PathBuf {
        if let Ok(home) = std::env::var("STRATA_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".strata"),
            |h| h.join(".config").join("strata"),
        )
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        strata_home().join("config.toml")
    }
}

impl Config {
    const DEFAULT_PERSIST_DEBOUNCE_MS: u64 = 750;

    /// Loads configuration from the default config path.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Creates a default config file at the given path.
    /// Returns an error if the file already exists.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        Self::write_config(path, default_config_template())
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    /// Opaque settings for proposal requests.
    pub fn proposal_settings(&self) -> ServiceSettings {
        model_settings(self.services.proposal_model.as_deref())
    }

    /// Opaque settings for validation requests.
    pub fn validation_settings(&self) -> ServiceSettings {
        model_settings(self.services.validation_model.as_deref())
    }

    /// Writes config content to a file, creating parent directories as needed.
    /// Uses atomic write (temp file + rename) to prevent corruption.
    fn write_config(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        Ok(())
    }
}

fn model_settings(model: Option<&str>) -> ServiceSettings {
    let mut settings = ServiceSettings::new();
    if let Some(model) = model.map(str::trim).filter(|m| !m.is_empty()) {
        settings.insert("model".to_string(), Value::String(model.to_string()));
    }
    settings
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_grow_graph: true,
            validate_answers: false,
            deep_research: false,
            persist_debounce_ms: Self::DEFAULT_PERSIST_DEBOUNCE_MS,
            services: ServicesConfig::default(),
        }
    }
}
