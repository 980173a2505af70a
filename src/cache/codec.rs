//! Artifact serialization for the cache store.
//!
//! Every stored payload is framed so a reader can tell whether it can trust
//! the bytes before touching the artifact itself:
//!
//! ```text
//! magic "GCAF" | header length (u32 LE) | header (JSON) | artifact (JSON)
//! ```
//!
//! The header names the format version, the schema the artifact was written
//! for, and a SHA-256 checksum of the artifact bytes. Any mismatch decodes
//! as [`CacheError::CorruptArtifact`], which callers treat as a miss.

// Author: kelexine (https://github.com/kelexine)

use crate::error::{CacheError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const ARTIFACT_MAGIC: [u8; 4] = *b"GCAF";

/// Bump on any breaking change to the header or payload layout.
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// Metadata framed in front of every encoded artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub format_version: u32,
    /// Schema (operation) the artifact was produced for.
    pub schema: String,
    /// Hex SHA-256 of the artifact bytes.
    pub checksum: String,
}

/// Encodes and decodes artifacts to the framed on-disk representation.
pub struct ArtifactCodec;

impl ArtifactCodec {
    pub fn encode<T: Serialize>(artifact: &T, schema: &str) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(artifact)?;
        let header = ArtifactHeader {
            format_version: ARTIFACT_FORMAT_VERSION,
            schema: schema.to_string(),
            checksum: checksum(&payload),
        };
        let header_bytes = serde_json::to_vec(&header)?;

        let mut output = Vec::with_capacity(8 + header_bytes.len() + payload.len());
        output.extend_from_slice(&ARTIFACT_MAGIC);
        output.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
        output.extend_from_slice(&header_bytes);
        output.extend_from_slice(&payload);
        Ok(output)
    }

    /// Decodes an artifact written for `schema_hint`.
    pub fn decode<T: DeserializeOwned>(bytes: &[u8], schema_hint: &str) -> Result<T> {
        let (header, payload) = Self::split(bytes)?;

        if header.schema != schema_hint {
            return Err(CacheError::corrupt(format!(
                "artifact was written for schema '{}', expected '{}'",
                header.schema, schema_hint
            )));
        }

        let actual = checksum(payload);
        if actual != header.checksum {
            return Err(CacheError::corrupt(format!(
                "checksum mismatch: expected {}, got {}",
                header.checksum, actual
            )));
        }

        serde_json::from_slice(payload)
            .map_err(|e| CacheError::corrupt(format!("payload does not match schema: {}", e)))
    }

    /// Reads and validates only the header.
    pub fn inspect(bytes: &[u8]) -> Result<ArtifactHeader> {
        Self::split(bytes).map(|(header, _)| header)
    }

    fn split(bytes: &[u8]) -> Result<(ArtifactHeader, &[u8])> {
        if bytes.len() < 8 {
            return Err(CacheError::corrupt("artifact is truncated"));
        }
        if bytes[..4] != ARTIFACT_MAGIC {
            return Err(CacheError::corrupt("missing magic bytes"));
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[4..8]);
        let header_len = u32::from_le_bytes(len_bytes) as usize;
        let header_end = 8usize
            .checked_add(header_len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| CacheError::corrupt("header length exceeds artifact size"))?;

        let header: ArtifactHeader = serde_json::from_slice(&bytes[8..header_end])
            .map_err(|e| CacheError::corrupt(format!("unreadable header: {}", e)))?;

        if header.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(CacheError::corrupt(format!(
                "unsupported format version {} (expected {})",
                header.format_version, ARTIFACT_FORMAT_VERSION
            )));
        }

        Ok((header, &bytes[header_end..]))
    }
}

fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
