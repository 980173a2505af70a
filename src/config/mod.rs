// Configuration module
// Author: kelexine (https://github.com/kelexine)

mod models;

pub use models::*;

use crate::error::{CacheError, Result};
use config::{Config, Environment, File};
use std::path::{Path, PathBuf};

/// Prefix for environment overrides, e.g. `GENCACHE_CACHE__ENABLED=false`.
pub const ENV_PREFIX: &str = "GENCACHE";

impl AppConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. CLI arguments (highest, applied by the caller)
    /// 2. Environment variables
    /// 3. Config file
    /// 4. Defaults (lowest)
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_config_path())
    }

    /// Same as [`AppConfig::load`] with an explicit config file location.
    /// A missing file is not an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = Config::builder()
            // Start with defaults
            .add_source(Config::try_from(&Self::default())?)
            // Load from config file if it exists
            .add_source(File::from(path).required(false))
            // Override with environment variables (prefix: GENCACHE_, nested keys split on "__")
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| CacheError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| CacheError::Config(e.to_string()))
    }

    pub fn default_config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".gencache")
            .join("config.toml")
    }

    /// Renders the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CacheError::Config(e.to_string()))
    }
}
