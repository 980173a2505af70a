// Error types for gencache
// Author: kelexine (https://github.com/kelexine)

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cannot canonicalize parameter '{key}': {reason}")]
    Encoding { key: String, reason: String },

    #[error("Cache store unavailable at {}: {reason}", path.display())]
    StoreUnavailable { path: PathBuf, reason: String },

    #[error("Corrupt cached artifact: {reason}")]
    CorruptArtifact { reason: String },

    #[error("Artifact of {size} bytes exceeds cache capacity of {capacity} bytes")]
    ArtifactTooLarge { size: u64, capacity: u64 },

    /// Error raised by the external generation function, shared by every
    /// caller that joined the same in-flight generation.
    #[error("{0}")]
    Generation(Arc<anyhow::Error>),

    #[error("Generation was cancelled before it completed")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config parsing error: {0}")]
    ConfigParsing(#[from] config::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CacheError {
    pub(crate) fn store(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        CacheError::StoreUnavailable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        CacheError::CorruptArtifact {
            reason: reason.into(),
        }
    }

    /// Whether the cache layer can absorb this error and keep serving results.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CacheError::StoreUnavailable { .. }
                | CacheError::CorruptArtifact { .. }
                | CacheError::ArtifactTooLarge { .. }
        )
    }

    /// The underlying generator error, if this is a generation failure.
    pub fn generation_error(&self) -> Option<&anyhow::Error> {
        match self {
            CacheError::Generation(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
