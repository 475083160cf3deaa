//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Channel credentials never live here; they come from the state file.
//! The `[[tokens]]` table is the gateway's client auth: each entry maps a
//! bearer token to a user, a group, and optionally a pinned channel.

use dispatch::{ModelPrice, PriceTable};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Retry, health, and cache knobs
#[derive(Debug, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_health_queue_capacity")]
    pub health_queue_capacity: usize,
    #[serde(default = "default_error_log_enabled")]
    pub error_log_enabled: bool,
    #[serde(default = "default_cache_refresh_secs")]
    pub cache_refresh_secs: u64,
    /// Persist multi-key polling cursors so rotation position survives a
    /// restart. When off, cursors are carried across cache refreshes in
    /// memory only.
    #[serde(default = "default_persist_cursors")]
    pub persist_cursors: bool,
}

/// Durable state locations
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// JSON state file holding channels, balances, and usage counters
    pub state_path: PathBuf,
    /// JSONL error log; defaults to `<state_path dir>/error-log.jsonl`
    #[serde(default)]
    pub error_log_path: Option<PathBuf>,
}

/// Model pricing
#[derive(Debug, Default, Deserialize)]
pub struct PricingConfig {
    /// Quota per 1k tokens for models without an explicit entry; 0 makes
    /// unknown models free
    #[serde(default)]
    pub default_quota_per_1k: u64,
    #[serde(default)]
    pub models: HashMap<String, ModelPrice>,
}

/// One client bearer token
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// Bearer key; `key_env` takes precedence when set
    #[serde(default)]
    pub key: String,
    /// Environment variable to read the bearer key from, keeping the secret
    /// out of the config file
    #[serde(default)]
    pub key_env: Option<String>,
    pub user_id: u64,
    pub token_id: u64,
    #[serde(default = "default_group")]
    pub group: String,
    /// Pin every request from this token to one channel
    #[serde(default)]
    pub channel_id: Option<u64>,
}

fn default_timeout() -> u64 {
    300
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_health_queue_capacity() -> usize {
    256
}

fn default_error_log_enabled() -> bool {
    true
}

fn default_cache_refresh_secs() -> u64 {
    60
}

fn default_persist_cursors() -> bool {
    true
}

fn default_group() -> String {
    "default".to_string()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            health_queue_capacity: default_health_queue_capacity(),
            error_log_enabled: default_error_log_enabled(),
            cache_refresh_secs: default_cache_refresh_secs(),
            persist_cursors: default_persist_cursors(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, overlay environment variables,
    /// and validate.
    ///
    /// Token key resolution order:
    /// 1. env var named by `key_env`
    /// 2. `key` from the config file
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        // Resolve token keys: env var takes precedence over the file value
        for token in &mut config.tokens {
            if let Some(var) = &token.key_env
                && let Ok(value) = std::env::var(var)
                && !value.is_empty()
            {
                token.key = value;
            }
        }

        if config.server.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.dispatch.cache_refresh_secs == 0 {
            return Err(common::Error::Config(
                "cache_refresh_secs must be greater than 0".into(),
            ));
        }

        if config.dispatch.health_queue_capacity == 0 {
            return Err(common::Error::Config(
                "health_queue_capacity must be greater than 0".into(),
            ));
        }

        let mut seen = HashSet::new();
        for token in &config.tokens {
            if token.key.is_empty() {
                return Err(common::Error::Config("token key must not be empty".into()));
            }
            if !seen.insert(token.key.as_str()) {
                return Err(common::Error::Config(format!(
                    "duplicate token key for user {}",
                    token.user_id
                )));
            }
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("relay-gateway.toml")
    }

    pub fn price_table(&self) -> PriceTable {
        PriceTable::new(
            self.pricing.default_quota_per_1k,
            self.pricing.models.clone(),
        )
    }

    /// Error log location, defaulting next to the state file.
    pub fn error_log_path(&self) -> PathBuf {
        match &self.storage.error_log_path {
            Some(path) => path.clone(),
            None => self
                .storage
                .state_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("error-log.jsonl"),
        }
    }
}
