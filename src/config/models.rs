//! Configuration data structures for gencache.
//!
//! This module defines the schema for the application settings: where the
//! response store lives, how large it may grow, and how logs are emitted.
//!
//! Author: kelexine (<https://github.com/kelexine>)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The root configuration object for the application.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Response cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging and observability settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Settings for the persistent response cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether generation results are looked up in and written to the store.
    /// Default: `true`
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Location of the embedded store file.
    /// Default: `<user cache dir>/gencache/responses.db`
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Capacity ceiling for stored payloads, in megabytes.
    /// Default: `500`
    #[serde(default = "default_capacity_mb")]
    pub capacity_mb: u64,

    /// How long a write waits on another process holding the store lock.
    /// Default: `5000`
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl CacheConfig {
    /// Capacity ceiling in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_mb.saturating_mul(1024 * 1024)
    }
}

/// Settings for application logging and output format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum log level (`trace`, `debug`, `info`, `warn`, `error`).
    /// Default: `warn`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format for logs (`pretty`, `json`, `compact`).
    /// Default: `compact`
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default trait implementations linking to custom logic

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store_path: default_store_path(),
            capacity_mb: default_capacity_mb(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Helper functions for serde defaults and shared constants
fn default_true() -> bool {
    true
}

fn default_store_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gencache")
        .join("responses.db")
}

fn default_capacity_mb() -> u64 {
    500
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}
