//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};

use crate::error::{LimiterError, Result};
use crate::ratelimit::{PolicySet, DEFAULT_PREFIX};

/// Environment variable prefix for configuration overrides, e.g.
/// `TOLLGATE__STORE__REDIS_URL`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Inline rate limit policies
    #[serde(default)]
    pub policies: PolicySet,
}

/// Which store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local state; only correct for a single process
    #[default]
    Memory,
    /// A shared redis server
    Redis,
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Register the procedures with redis at startup
    #[serde(default = "default_preload_scripts")]
    pub preload_scripts: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            preload_scripts: default_preload_scripts(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_preload_scripts() -> bool {
    true
}

/// Limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Namespace for every store key
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Optional path to an additional policy file
    pub policies_path: Option<String>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            policies_path: None,
        }
    }
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

impl TollgateConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| LimiterError::Config(e.to_string()))
    }

    /// Load configuration from an optional file, then apply `TOLLGATE__*`
    /// environment overrides for store and limiter settings.
    ///
    /// Policies are read from the file as written (names are case
    /// sensitive), plus any file named by `limiter.policies_path`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut loaded = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        let overrides = config::Config::builder()
            .add_source(config::Config::try_from(&loaded.settings()).map_err(config_error)?)
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(config_error)?;
        let settings: Settings = overrides.try_deserialize().map_err(config_error)?;
        loaded.store = settings.store;
        loaded.limiter = settings.limiter;

        if let Some(policies_path) = &loaded.limiter.policies_path {
            let extra = PolicySet::from_file(policies_path)?;
            loaded.policies.merge(extra);
        }
        loaded.policies.validate()?;

        Ok(loaded)
    }

    fn settings(&self) -> Settings {
        Settings {
            store: self.store.clone(),
            limiter: self.limiter.clone(),
        }
    }
}

/// The part of the configuration that environment variables may override.
#[derive(Debug, Serialize, Deserialize)]
struct Settings {
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    limiter: LimiterConfig,
}

fn config_error(e: config::ConfigError) -> LimiterError {
    LimiterError::Config(e.to_string())
}
