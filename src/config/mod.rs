pub mod schema;

pub use schema::{
    Config, ConsumptionConfig, FreeTierConfig, GatewayConfig, StorageBackend, StorageConfig,
};

use crate::billing::{EngineSettings, FreeTierPolicy};
use anyhow::{Context, Result};
use directories::UserDirs;
use std::path::{Path, PathBuf};

/// Overrides the SQLite database path.
pub const ENV_DB_PATH: &str = "CREDITGATE_DB_PATH";
/// Overrides `free_tier.policy` (`enforced` or `unlimited`).
pub const ENV_FREE_TIER_POLICY: &str = "CREDITGATE_FREE_TIER_POLICY";

/// `~/.creditgate/config.toml`, if a home directory can be found.
pub fn default_config_path() -> Option<PathBuf> {
    UserDirs::new().map(|dirs| dirs.home_dir().join(".creditgate").join("config.toml"))
}

impl Config {
    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing file yields defaults. Environment overrides are applied
    /// and the result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path(),
        };

        let mut config = match path.as_deref() {
            Some(p) if p.exists() => {
                let contents = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config {}", p.display()))?;
                let mut config = Self::from_toml(&contents)
                    .with_context(|| format!("Failed to parse config {}", p.display()))?;
                config.config_path = p.to_path_buf();
                config
            }
            Some(p) => {
                tracing::debug!(path = %p.display(), "No config file; using defaults");
                Self {
                    config_path: p.to_path_buf(),
                    ..Self::default()
                }
            }
            None => Self::default(),
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply `CREDITGATE_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_DB_PATH).filter(|v| !v.trim().is_empty()) {
            self.storage.path = path;
        }
        if let Some(policy) = lookup(ENV_FREE_TIER_POLICY).filter(|v| !v.trim().is_empty()) {
            self.free_tier.policy = policy
                .parse::<FreeTierPolicy>()
                .with_context(|| format!("Invalid {ENV_FREE_TIER_POLICY}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.pool_size == 0 {
            anyhow::bail!("storage.pool_size must be at least 1");
        }
        if self.consumption.max_units_per_call == 0 {
            anyhow::bail!("consumption.max_units_per_call must be at least 1");
        }
        if self.storage.backend == StorageBackend::Sqlite && self.storage.path.trim().is_empty() {
            anyhow::bail!("storage.path must not be empty for the sqlite backend");
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            policy: self.free_tier.policy,
            allotments: self.free_tier.allotments(),
            max_units_per_call: self.consumption.max_units_per_call,
        }
    }
}

/// JSON Schema of `config.toml`, pretty-printed.
pub fn json_schema() -> Result<String> {
    let schema = schemars::schema_for!(Config);
    Ok(serde_json::to_string_pretty(&schema)?)
}
