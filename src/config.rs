//! Configuration management for Gatekeeper.
//!
//! Configuration is read from an optional YAML/TOML/JSON file and then
//! overridden by `GATEKEEPER__SECTION__FIELD` environment variables, e.g.
//! `GATEKEEPER__STORE__URL=redis://127.0.0.1/`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatekeeperError, Result};
use crate::lock::LockConfig;
use crate::ratelimit::PolicyTable;
use crate::resilience::BreakerConfig;

/// Main configuration for the rate-limiting subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Limit policies
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Circuit breaker guarding the shared store
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Distributed lock settings
    #[serde(default)]
    pub lock: LockConfig,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL. Without one, counters live in an in-process store.
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix for every key written to the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on a single store call
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_key_prefix() -> String {
    "gatekeeper".to_string()
}

fn default_request_timeout_ms() -> u64 {
    250
}

impl StoreConfig {
    /// The per-call timeout as a duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Limit policies plus housekeeping for in-process counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(flatten)]
    pub policies: PolicyTable,

    /// How often expired in-process counters are swept
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            policies: PolicyTable::default(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_cleanup_interval() -> u64 {
    300
}

impl LimitsConfig {
    /// The sweep interval as a duration.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl GatekeeperConfig {
    /// Load configuration from an optional file, then the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("GATEKEEPER")
                .separator("__")
                .try_parsing(true),
        );

        let config: GatekeeperConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: GatekeeperConfig =
            serde_yaml::from_str(contents).map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the limiters cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.store.key_prefix.is_empty() {
            return Err(GatekeeperError::Config("store.key_prefix must not be empty".to_string()));
        }
        if self.store.request_timeout_ms == 0 {
            return Err(GatekeeperError::Config(
                "store.request_timeout_ms must be positive".to_string(),
            ));
        }
        if self.limits.cleanup_interval_secs == 0 {
            return Err(GatekeeperError::Config(
                "limits.cleanup_interval_secs must be positive".to_string(),
            ));
        }
        self.limits.policies.validate()?;
        self.breaker.validate()?;
        self.lock.validate()
    }
}
