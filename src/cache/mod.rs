// Response cache module
// Author: kelexine (https://github.com/kelexine)

//! Persistent memoization of expensive generation calls.
//!
//! [`MemoizingGenerator`] is the front door. Requests are reduced to a
//! [`Fingerprint`], results are framed by [`ArtifactCodec`] and kept in a
//! size-bounded [`CacheStore`] that evicts least-recently-used entries.

pub mod clock;
pub mod codec;
pub mod eviction;
pub mod fingerprint;
mod flight;
pub mod manager;
pub mod models;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{ArtifactCodec, ArtifactHeader, ARTIFACT_FORMAT_VERSION};
pub use eviction::{EvictionOutcome, LruEviction};
pub use fingerprint::{
    Fingerprint, FingerprintBuilder, GenerationRequest, GenerationRequestBuilder, ParamValue,
};
pub use manager::{Memoized, MemoizingGenerator};
pub use models::{CacheEntry, GeneratorStats, StoreMetadata};
pub use store::{CacheStore, StoreOptions, DEFAULT_CAPACITY_BYTES};
