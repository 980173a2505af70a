// Memoizing generator - the single entry point for cached generation
// Author: kelexine (https://github.com/kelexine)

use crate::cache::codec::ArtifactCodec;
use crate::cache::fingerprint::{Fingerprint, FingerprintBuilder, GenerationRequest};
use crate::cache::flight::{FlightTable, Role};
use crate::cache::models::{GeneratorStats, StoreMetadata};
use crate::cache::store::{CacheStore, StoreOptions};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::metrics;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// A generation result, annotated with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Memoized<T> {
    pub artifact: T,
    /// `true` when served from the store rather than freshly generated.
    pub from_cache: bool,
}

type FlightOutcome<T> = std::result::Result<Memoized<T>, Arc<anyhow::Error>>;

enum Lookup<T> {
    Hit(T),
    Miss,
    /// The store failed; skip it for the rest of this call.
    Unavailable,
}

struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    generations: AtomicU64,
    coalesced: AtomicU64,
    store_errors: AtomicU64,
}

impl AtomicStats {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            generations: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
        }
    }

    fn to_stats(&self) -> GeneratorStats {
        GeneratorStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            generations: self.generations.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

/// Front-ends an expensive generation function with the persistent store.
///
/// Per call: fingerprint the request, consult the store, join or lead the
/// in-process flight for that fingerprint, generate on a miss, persist, and
/// return. Store trouble of any kind degrades to calling the generator
/// directly; only fingerprinting and generation errors reach the caller.
///
/// Clones share the store, the flight table and the statistics.
pub struct MemoizingGenerator<T> {
    store: Option<Arc<CacheStore>>,
    flights: FlightTable<FlightOutcome<T>>,
    stats: Arc<AtomicStats>,
}

impl<T> Clone for MemoizingGenerator<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            flights: self.flights.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<T> MemoizingGenerator<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Caches through `store`.
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self {
            store: Some(store),
            flights: FlightTable::new(),
            stats: Arc::new(AtomicStats::new()),
        }
    }

    /// Never touches a store; every call generates (still single-flighted).
    pub fn disabled() -> Self {
        Self {
            store: None,
            flights: FlightTable::new(),
            stats: Arc::new(AtomicStats::new()),
        }
    }

    /// Builds a generator from configuration, opening the configured store.
    ///
    /// A store that cannot be opened disables caching instead of failing.
    pub fn from_config(config: &CacheConfig) -> Self {
        if !config.enabled {
            debug!("Response cache disabled by configuration");
            return Self::disabled();
        }

        match CacheStore::open(&config.store_path, StoreOptions::from_config(config)) {
            Ok(store) => Self::new(Arc::new(store)),
            Err(e) => {
                warn!("Response cache unavailable, continuing without it: {}", e);
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn store(&self) -> Option<&Arc<CacheStore>> {
        self.store.as_ref()
    }

    pub fn stats(&self) -> GeneratorStats {
        self.stats.to_stats()
    }

    /// Number of fingerprints currently being generated in this process.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    /// Returns the artifact for `request`, calling `generate` only when no
    /// usable cached result exists and no other caller in this process is
    /// already generating it.
    ///
    /// Errors from `generate` are returned as [`CacheError::Generation`] to
    /// this caller and every caller that joined its flight; nothing is
    /// cached on failure.
    pub async fn generate<F, Fut>(
        &self,
        request: &GenerationRequest,
        generate: F,
    ) -> Result<Memoized<T>>
    where
        F: FnOnce(GenerationRequest) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let fingerprint = FingerprintBuilder::build(request)?;
        let operation = request.operation_name();

        let store_usable = match self.lookup(&fingerprint, operation, false).await {
            Lookup::Hit(artifact) => {
                return Ok(Memoized {
                    artifact,
                    from_cache: true,
                })
            }
            Lookup::Miss => true,
            Lookup::Unavailable => false,
        };

        self.run_flight(request, &fingerprint, store_usable, generate).await
    }

    /// Leads or follows the flight for `fingerprint` after a missed lookup.
    async fn run_flight<F, Fut>(
        &self,
        request: &GenerationRequest,
        fingerprint: &Fingerprint,
        mut store_usable: bool,
        generate: F,
    ) -> Result<Memoized<T>>
    where
        F: FnOnce(GenerationRequest) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let operation = request.operation_name();
        let leader = match self.flights.join(fingerprint) {
            Role::Leader(leader) => leader,
            Role::Follower(follower) => {
                self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_operation("coalesced");
                debug!("Joining in-flight generation for {}", fingerprint.short());
                return match follower.wait().await {
                    Some(Ok(memoized)) => Ok(memoized),
                    Some(Err(e)) => Err(CacheError::Generation(e)),
                    None => Err(CacheError::Cancelled),
                };
            }
        };

        // A flight that finished between our lookup and join has stored its result
        if store_usable {
            match self.lookup(fingerprint, operation, true).await {
                Lookup::Hit(artifact) => {
                    let memoized = Memoized {
                        artifact,
                        from_cache: true,
                    };
                    leader.complete(Ok(memoized.clone()));
                    return Ok(memoized);
                }
                Lookup::Miss => {}
                Lookup::Unavailable => store_usable = false,
            }
        }

        debug!(
            "Generating {} for {} via {}",
            operation,
            fingerprint.short(),
            request.model_identifier()
        );
        self.stats.generations.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let result = generate(request.clone()).await;
        metrics::record_generation(operation, result.is_ok(), started.elapsed().as_secs_f64());

        match result {
            Ok(artifact) => {
                let memoized = Memoized {
                    artifact,
                    from_cache: false,
                };
                // Followers are answered before the write; the flight stays
                // open until the write lands so no second generation starts
                leader.complete(Ok(memoized.clone()));
                if store_usable {
                    self.persist(fingerprint, operation, &memoized.artifact).await;
                }
                Ok(memoized)
            }
            Err(e) => {
                debug!("Generation failed for {}: {:#}", fingerprint.short(), e);
                let e = Arc::new(e);
                leader.complete(Err(Arc::clone(&e)));
                Err(CacheError::Generation(e))
            }
        }
    }

    /// Consults the store. A `recheck` lookup does not count as a second miss.
    async fn lookup(
        &self,
        fingerprint: &Fingerprint,
        operation: &str,
        recheck: bool,
    ) -> Lookup<T> {
        let Some(store) = &self.store else {
            return Lookup::Miss;
        };

        let key = fingerprint.clone();
        let entry = match run_blocking(store, move |store| store.get(&key)).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Cache lookup failed, generating without cache: {}", e);
                self.stats.store_errors.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_operation("degraded");
                return Lookup::Unavailable;
            }
        };

        let Some(entry) = entry else {
            if !recheck {
                debug!("Cache miss for {}", fingerprint.short());
                self.record_miss();
            }
            return Lookup::Miss;
        };

        match ArtifactCodec::decode::<T>(&entry.payload, operation) {
            Ok(artifact) => {
                debug!("Cache hit for {}", fingerprint.short());
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_operation("hit");
                Lookup::Hit(artifact)
            }
            Err(e) => {
                warn!("Ignoring unreadable cache entry {}: {}", fingerprint.short(), e);
                metrics::record_cache_operation("corrupt");
                if !recheck {
                    self.record_miss();
                }
                Lookup::Miss
            }
        }
    }

    async fn persist(&self, fingerprint: &Fingerprint, operation: &str, artifact: &T) {
        let Some(store) = &self.store else {
            return;
        };

        let payload = match ArtifactCodec::encode(artifact, operation) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Cannot encode result for {}: {}", fingerprint.short(), e);
                self.stats.store_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let key = fingerprint.clone();
        let stored = run_blocking(store, move |store| -> Result<StoreMetadata> {
            store.put(&key, &payload)?;
            store.stats()
        })
        .await;

        match stored {
            Ok(meta) => {
                metrics::record_cache_operation("store");
                metrics::update_store_usage(&meta);
            }
            Err(e) => {
                warn!("Result for {} was not cached: {}", fingerprint.short(), e);
                self.stats.store_errors.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_operation("degraded");
            }
        }
    }

    fn record_miss(&self) {
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_operation("miss");
    }
}

/// Runs a store operation on the blocking pool.
async fn run_blocking<R, F>(store: &Arc<CacheStore>, op: F) -> Result<R>
where
    F: FnOnce(&CacheStore) -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    let store = Arc::clone(store);
    let path = store.path().to_path_buf();
    match tokio::task::spawn_blocking(move || op(&store)).await {
        Ok(result) => result,
        Err(e) => Err(CacheError::store(path, format!("store task failed: {}", e))),
    }
}
