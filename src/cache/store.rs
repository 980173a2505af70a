//! Embedded, crash-safe response store.
//!
//! Backed by a single SQLite file in WAL mode. Each CLI invocation opens its
//! own connection; SQLite's locking gives many readers and one writer across
//! processes, and every mutation below runs in one transaction so a reader
//! never sees an entry without its matching counters. Concurrent writers of
//! the same fingerprint resolve as last-writer-wins.

// Author: kelexine (https://github.com/kelexine)

use crate::cache::clock::{from_millis, Clock, SystemClock};
use crate::cache::eviction::{EvictionOutcome, LruEviction};
use crate::cache::fingerprint::Fingerprint;
use crate::cache::models::{CacheEntry, StoreMetadata};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::metrics;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default capacity ceiling: 500 MB.
pub const DEFAULT_CAPACITY_BYTES: u64 = 500 * 1024 * 1024;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entries (
    fingerprint      TEXT PRIMARY KEY NOT NULL,
    payload          BLOB NOT NULL,
    size_bytes       INTEGER NOT NULL,
    created_at       INTEGER NOT NULL,
    last_accessed_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS entries_lru ON entries (last_accessed_at, fingerprint);

CREATE TABLE IF NOT EXISTS store_meta (
    id             INTEGER PRIMARY KEY CHECK (id = 1),
    total_bytes    INTEGER NOT NULL,
    entry_count    INTEGER NOT NULL,
    capacity_bytes INTEGER NOT NULL
);
";

/// How a [`CacheStore`] is opened.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Ceiling on the summed payload size of all entries.
    pub capacity_bytes: u64,
    /// How long a write waits for another process to release the lock.
    pub busy_timeout: Duration,
    /// Serve lookups only. Lookups do not refresh access times and every
    /// mutation fails with [`CacheError::StoreUnavailable`].
    pub read_only: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
            busy_timeout: Duration::from_secs(5),
            read_only: false,
        }
    }
}

impl StoreOptions {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            capacity_bytes: config.capacity_bytes(),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
            read_only: false,
        }
    }

    pub fn with_capacity(mut self, capacity_bytes: u64) -> Self {
        self.capacity_bytes = capacity_bytes;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// Point-lookup store mapping fingerprints to encoded artifacts.
#[derive(Debug)]
pub struct CacheStore {
    path: PathBuf,
    conn: Mutex<Connection>,
    options: StoreOptions,
    clock: Arc<dyn Clock>,
    eviction: LruEviction,
}

impl CacheStore {
    /// Opens (creating if needed) the store at `path`.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        Self::open_with_clock(path, options, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        path: impl AsRef<Path>,
        options: StoreOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let fail = |e: rusqlite::Error| CacheError::store(&path, e);

        let flags = if options.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| CacheError::store(parent, e))?;
            }
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
        };

        let mut conn = Connection::open_with_flags(&path, flags).map_err(fail)?;
        conn.busy_timeout(options.busy_timeout).map_err(fail)?;

        if !options.read_only {
            // Only takes effect on a fresh file; must precede table creation
            conn.pragma_update(None, "auto_vacuum", "INCREMENTAL")
                .map_err(fail)?;
            let mode: String = conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
                .map_err(fail)?;
            if !mode.eq_ignore_ascii_case("wal") {
                warn!("Store at {} is using journal mode {}", path.display(), mode);
            }
            conn.pragma_update(None, "synchronous", "FULL").map_err(fail)?;

            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(fail)?;
            tx.execute_batch(SCHEMA).map_err(fail)?;
            tx.execute(
                "INSERT OR IGNORE INTO store_meta (id, total_bytes, entry_count, capacity_bytes)
                 VALUES (1, 0, 0, ?1)",
                params![sql_int(options.capacity_bytes)],
            )
            .map_err(fail)?;
            tx.execute(
                "UPDATE store_meta SET capacity_bytes = ?1 WHERE id = 1",
                params![sql_int(options.capacity_bytes)],
            )
            .map_err(fail)?;

            // A smaller ceiling than last time takes effect immediately
            let outcome = LruEviction
                .evict_until_fits(&tx, 0, options.capacity_bytes)
                .map_err(fail)?;
            tx.commit().map_err(fail)?;

            if let EvictionOutcome::Fits { evicted } = outcome {
                if !evicted.is_empty() {
                    debug!(
                        "Evicted {} entries to fit capacity of {} bytes",
                        evicted.len(),
                        options.capacity_bytes
                    );
                    metrics::record_evictions(evicted.len());
                }
            }
        }

        let store = Self {
            path,
            conn: Mutex::new(conn),
            options,
            clock,
            eviction: LruEviction,
        };

        // Surfaces "file is not a database" and missing schema at open time
        let meta = store.stats()?;
        debug!(
            "Opened cache store at {} ({} entries, {} / {} bytes)",
            store.path.display(),
            meta.entry_count,
            meta.total_bytes,
            store.options.capacity_bytes
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.options.capacity_bytes
    }

    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    /// Looks up an entry and refreshes its `last_accessed_at`.
    pub fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT payload, size_bytes, created_at, last_accessed_at
                 FROM entries WHERE fingerprint = ?1",
                params![fingerprint.as_str()],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| self.unavailable(e))?;

        let Some((payload, size_bytes, created_at, mut last_accessed_at)) = row else {
            return Ok(None);
        };

        if !self.options.read_only {
            let now = self.clock.now().timestamp_millis();
            // A hit is still a hit when another writer holds the lock past busy_timeout
            match conn.execute(
                "UPDATE entries SET last_accessed_at = ?1 WHERE fingerprint = ?2",
                params![now, fingerprint.as_str()],
            ) {
                Ok(_) => last_accessed_at = now,
                Err(e) => warn!(
                    "Could not refresh access time of {}: {}",
                    fingerprint.short(),
                    e
                ),
            }
        }

        Ok(Some(CacheEntry {
            fingerprint: fingerprint.clone(),
            payload,
            created_at: from_millis(created_at),
            last_accessed_at: from_millis(last_accessed_at),
            size_bytes: size_bytes as u64,
        }))
    }

    /// Whether an entry exists, without touching its access time.
    pub fn contains(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT 1 FROM entries WHERE fingerprint = ?1",
            params![fingerprint.as_str()],
            |_| Ok(()),
        )
        .optional()
        .map(|found| found.is_some())
        .map_err(|e| self.unavailable(e))
    }

    /// Stores `payload` under `fingerprint`, replacing any previous entry.
    ///
    /// Evicts least-recently-used entries first when the payload would push
    /// usage over capacity. A payload larger than the whole capacity is
    /// rejected with [`CacheError::ArtifactTooLarge`] and the store is left
    /// untouched.
    pub fn put(&self, fingerprint: &Fingerprint, payload: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let size = payload.len() as u64;

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| self.unavailable(e))?;

        // The entry being replaced no longer counts against capacity
        let previous: Option<i64> = tx
            .query_row(
                "SELECT size_bytes FROM entries WHERE fingerprint = ?1",
                params![fingerprint.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| self.unavailable(e))?;
        if let Some(previous) = previous {
            tx.execute(
                "DELETE FROM entries WHERE fingerprint = ?1",
                params![fingerprint.as_str()],
            )
            .map_err(|e| self.unavailable(e))?;
            tx.execute(
                "UPDATE store_meta
                 SET total_bytes = MAX(total_bytes - ?1, 0), entry_count = MAX(entry_count - 1, 0)
                 WHERE id = 1",
                params![previous],
            )
            .map_err(|e| self.unavailable(e))?;
        }

        let evicted = match self
            .eviction
            .evict_until_fits(&tx, size, self.options.capacity_bytes)
            .map_err(|e| self.unavailable(e))?
        {
            EvictionOutcome::Fits { evicted } => evicted,
            EvictionOutcome::TooLarge => {
                return Err(CacheError::ArtifactTooLarge {
                    size,
                    capacity: self.options.capacity_bytes,
                });
            }
        };

        let now = self.clock.now().timestamp_millis();
        tx.execute(
            "INSERT INTO entries (fingerprint, payload, size_bytes, created_at, last_accessed_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![fingerprint.as_str(), payload, size as i64, now],
        )
        .map_err(|e| self.unavailable(e))?;
        tx.execute(
            "UPDATE store_meta
             SET total_bytes = total_bytes + ?1, entry_count = entry_count + 1
             WHERE id = 1",
            params![size as i64],
        )
        .map_err(|e| self.unavailable(e))?;
        tx.commit().map_err(|e| self.unavailable(e))?;

        debug!(
            "Stored {} ({} bytes, {} evicted)",
            fingerprint.short(),
            size,
            evicted.len()
        );
        metrics::record_evictions(evicted.len());
        Ok(())
    }

    /// Removes an entry. Returns whether one was present.
    pub fn delete(&self, fingerprint: &Fingerprint) -> Result<bool> {
        self.ensure_writable()?;
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| self.unavailable(e))?;

        let size: Option<i64> = tx
            .query_row(
                "SELECT size_bytes FROM entries WHERE fingerprint = ?1",
                params![fingerprint.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| self.unavailable(e))?;
        let Some(size) = size else {
            return Ok(false);
        };

        tx.execute(
            "DELETE FROM entries WHERE fingerprint = ?1",
            params![fingerprint.as_str()],
        )
        .map_err(|e| self.unavailable(e))?;
        tx.execute(
            "UPDATE store_meta
             SET total_bytes = MAX(total_bytes - ?1, 0), entry_count = MAX(entry_count - 1, 0)
             WHERE id = 1",
            params![size],
        )
        .map_err(|e| self.unavailable(e))?;
        tx.commit().map_err(|e| self.unavailable(e))?;

        debug!("Deleted {}", fingerprint.short());
        Ok(true)
    }

    /// Removes every entry and resets the counters. Returns how many were removed.
    pub fn clear(&self) -> Result<u64> {
        self.ensure_writable()?;
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| self.unavailable(e))?;
        let removed = tx
            .execute("DELETE FROM entries", [])
            .map_err(|e| self.unavailable(e))?;
        tx.execute(
            "UPDATE store_meta SET total_bytes = 0, entry_count = 0 WHERE id = 1",
            [],
        )
        .map_err(|e| self.unavailable(e))?;
        tx.commit().map_err(|e| self.unavailable(e))?;

        // Hand freed pages back to the filesystem; failure only costs disk space
        if let Err(e) = conn.execute_batch("PRAGMA incremental_vacuum;") {
            debug!("Incremental vacuum skipped: {}", e);
        }

        debug!("Cleared {} entries from {}", removed, self.path.display());
        Ok(removed as u64)
    }

    /// Snapshot of the store counters. `capacity_bytes` is this handle's ceiling.
    pub fn stats(&self) -> Result<StoreMetadata> {
        let conn = self.conn.lock();
        let (total_bytes, entry_count) = conn
            .query_row(
                "SELECT total_bytes, entry_count FROM store_meta WHERE id = 1",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
            .map_err(|e| self.unavailable(e))?
            .unwrap_or((0, 0));

        Ok(StoreMetadata {
            total_bytes: total_bytes.max(0) as u64,
            entry_count: entry_count.max(0) as u64,
            capacity_bytes: self.options.capacity_bytes,
        })
    }

    /// Makes room for `incoming_bytes` without storing anything.
    pub fn evict_until_fits(&self, incoming_bytes: u64) -> Result<Vec<Fingerprint>> {
        self.ensure_writable()?;
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| self.unavailable(e))?;
        let outcome = self
            .eviction
            .evict_until_fits(&tx, incoming_bytes, self.options.capacity_bytes)
            .map_err(|e| self.unavailable(e))?;
        match outcome {
            EvictionOutcome::Fits { evicted } => {
                tx.commit().map_err(|e| self.unavailable(e))?;
                metrics::record_evictions(evicted.len());
                Ok(evicted.into_iter().map(|(fp, _)| fp).collect())
            }
            EvictionOutcome::TooLarge => Err(CacheError::ArtifactTooLarge {
                size: incoming_bytes,
                capacity: self.options.capacity_bytes,
            }),
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.options.read_only {
            return Err(CacheError::store(&self.path, "store was opened read-only"));
        }
        Ok(())
    }

    fn unavailable(&self, err: rusqlite::Error) -> CacheError {
        CacheError::store(&self.path, err)
    }
}

/// SQLite integers are signed; byte counts past `i64::MAX` are clamped.
fn sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
