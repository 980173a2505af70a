//! Cache records, store counters and generator statistics.

// Author: kelexine (https://github.com/kelexine)

use crate::cache::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A persisted cache record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    /// Encoded artifact bytes (see [`ArtifactCodec`](crate::cache::ArtifactCodec)).
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    /// Refreshed on every successful read; drives LRU eviction.
    pub last_accessed_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Store-resident counters, kept in the same transactions as the entries
/// they describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreMetadata {
    pub total_bytes: u64,
    pub entry_count: u64,
    pub capacity_bytes: u64,
}

impl StoreMetadata {
    /// Fraction of the capacity in use, as a percentage.
    pub fn utilization_percent(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return 0.0;
        }
        self.total_bytes as f64 * 100.0 / self.capacity_bytes as f64
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.total_bytes)
    }
}

/// In-process counters for a [`MemoizingGenerator`](crate::cache::MemoizingGenerator).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GeneratorStats {
    /// Results served from the store.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// Calls made to the external generation function.
    pub generations: u64,
    /// Callers that joined another caller's in-flight generation.
    pub coalesced: u64,
    /// Store failures absorbed while serving a result.
    pub store_errors: u64,
}

impl GeneratorStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
