use crate::billing::{default_allotments, Feature, FreeAllotments, FreeTierPolicy};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Top-level `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Where this config was loaded from. Not serialized.
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Default tracing filter; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub free_tier: FreeTierConfig,

    #[serde(default)]
    pub consumption: ConsumptionConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            log_level: default_log_level(),
            storage: StorageConfig::default(),
            free_tier: FreeTierConfig::default(),
            consumption: ConsumptionConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// SQLite database path. `~` is expanded.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_db_path(),
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StorageConfig {
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).into_owned())
    }
}

fn default_db_path() -> String {
    "~/.creditgate/ledger.db".into()
}

fn default_pool_size() -> u32 {
    8
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FreeTierConfig {
    #[serde(default)]
    pub policy: FreeTierPolicy,

    /// Monthly free uses per feature. Features not listed have no free tier.
    #[serde(default = "default_allotments")]
    pub allotments: BTreeMap<Feature, u64>,
}

impl Default for FreeTierConfig {
    fn default() -> Self {
        Self {
            policy: FreeTierPolicy::default(),
            allotments: default_allotments(),
        }
    }
}

impl FreeTierConfig {
    pub fn allotments(&self) -> FreeAllotments {
        self.allotments.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConsumptionConfig {
    #[serde(default = "default_max_units_per_call")]
    pub max_units_per_call: u64,
}

impl Default for ConsumptionConfig {
    fn default() -> Self {
        Self {
            max_units_per_call: default_max_units_per_call(),
        }
    }
}

fn default_max_units_per_call() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,

    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bearer token for `POST /api/admin/credits`. Empty disables grants.
    #[serde(default)]
    pub admin_token: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            admin_token: String::new(),
        }
    }
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_gateway_port() -> u16 {
    3400
}
