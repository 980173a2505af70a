//! Least-recently-used eviction.
//!
//! Runs inside the store's write transaction, so the entries it removes and
//! the entry that prompted the eviction commit (or roll back) together.

// Author: kelexine (https://github.com/kelexine)

use crate::cache::fingerprint::Fingerprint;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

/// Result of making room for an incoming entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictionOutcome {
    /// The incoming entry now fits. Lists what was removed, oldest first.
    Fits { evicted: Vec<(Fingerprint, u64)> },
    /// The incoming entry is larger than the whole capacity. Nothing was removed.
    TooLarge,
}

/// Evicts by oldest `last_accessed_at`, ties broken by fingerprint order.
#[derive(Debug, Default, Clone, Copy)]
pub struct LruEviction;

impl LruEviction {
    /// Removes entries until `incoming_bytes` more bytes fit under `capacity_bytes`.
    ///
    /// `conn` is expected to be inside a write transaction.
    pub fn evict_until_fits(
        &self,
        conn: &Connection,
        incoming_bytes: u64,
        capacity_bytes: u64,
    ) -> rusqlite::Result<EvictionOutcome> {
        if incoming_bytes > capacity_bytes {
            return Ok(EvictionOutcome::TooLarge);
        }

        let mut total: u64 = conn.query_row(
            "SELECT total_bytes FROM store_meta WHERE id = 1",
            [],
            |row| row.get::<_, i64>(0),
        )? as u64;

        let mut evicted = Vec::new();
        while total + incoming_bytes > capacity_bytes {
            let victim = conn
                .query_row(
                    "SELECT fingerprint, size_bytes FROM entries
                     ORDER BY last_accessed_at ASC, fingerprint ASC
                     LIMIT 1",
                    [],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?;

            let Some((fingerprint, size)) = victim else {
                // Counters drifted from the table; an empty table uses nothing.
                conn.execute(
                    "UPDATE store_meta SET total_bytes = 0, entry_count = 0 WHERE id = 1",
                    [],
                )?;
                break;
            };

            conn.execute(
                "DELETE FROM entries WHERE fingerprint = ?1",
                params![fingerprint],
            )?;
            conn.execute(
                "UPDATE store_meta
                 SET total_bytes = MAX(total_bytes - ?1, 0), entry_count = MAX(entry_count - 1, 0)
                 WHERE id = 1",
                params![size],
            )?;

            let size = size as u64;
            total = total.saturating_sub(size);
            let fingerprint = Fingerprint::from_stored(fingerprint);
            debug!("Evicted {} ({} bytes)", fingerprint.short(), size);
            evicted.push((fingerprint, size));
        }

        Ok(EvictionOutcome::Fits { evicted })
    }
}
