//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{default_rules, FailurePolicy, LimitRule, DEFAULT_SWEEP_EVERY};

/// Prefix for environment variable overrides, e.g. `TURNSTILE__SERVER__LISTEN_ADDR`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rate limit rules
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Resolve caller identity from X-Forwarded-For and friends
    #[serde(default = "default_trust_forwarded_headers")]
    pub trust_forwarded_headers: bool,

    /// Serve `DELETE /v1/limits/...`; only enable behind a trusted network
    #[serde(default)]
    pub enable_admin_routes: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trust_forwarded_headers: default_trust_forwarded_headers(),
            enable_admin_routes: false,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_trust_forwarded_headers() -> bool {
    true
}

/// Which counter store to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    File,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// JSON file used by the file backend
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    /// Bound on waiting for the store's update lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Admit (open) or reject (closed) when the store fails
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Sweep stale records every N checks per operation; 0 disables
    #[serde(default = "default_sweep_every")]
    pub sweep_every: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
            lock_timeout_ms: default_lock_timeout_ms(),
            failure_policy: FailurePolicy::default(),
            sweep_every: default_sweep_every(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data/rate_limits.json")
}

fn default_lock_timeout_ms() -> u64 {
    500
}

fn default_sweep_every() -> u64 {
    DEFAULT_SWEEP_EVERY
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Rate limit rule configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_rules")]
    pub rules: Vec<LimitRule>,

    /// Re-read the configuration file every N seconds; 0 disables
    #[serde(default)]
    pub reload_interval_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            reload_interval_secs: 0,
        }
    }
}

impl TurnstileConfig {
    /// Load configuration from an optional YAML file layered with
    /// `TURNSTILE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.storage.lock_timeout_ms == 0 {
            return Err(TurnstileError::Config(
                "storage.lock_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.limits.rules.is_empty() {
            return Err(TurnstileError::Config(
                "limits.rules must contain at least one rule".to_string(),
            ));
        }
        for rule in &self.limits.rules {
            rule.policy()?;
        }
        Ok(())
    }
}
