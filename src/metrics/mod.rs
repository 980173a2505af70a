// Metrics module for Prometheus observability
// Author: kelexine (https://github.com/kelexine)

mod registry;

pub use registry::{gather_metrics, CACHE_OPERATIONS, GENERATION_DURATION, STORE_BYTES};

use crate::cache::StoreMetadata;

/// Helper to record a cache operation (hit, miss, store, evict, coalesced, degraded, corrupt)
pub fn record_cache_operation(operation: &str) {
    CACHE_OPERATIONS.with_label_values(&[operation]).inc();
}

pub fn record_evictions(count: usize) {
    if count > 0 {
        CACHE_OPERATIONS
            .with_label_values(&["evict"])
            .inc_by(count as f64);
    }
}

/// Helper to record an external generation call
pub fn record_generation(operation: &str, success: bool, duration_secs: f64) {
    let status = if success { "success" } else { "failure" };
    GENERATION_DURATION
        .with_label_values(&[operation, status])
        .observe(duration_secs);
}

pub fn update_store_usage(meta: &StoreMetadata) {
    STORE_BYTES
        .with_label_values(&["used"])
        .set(meta.total_bytes as f64);
    STORE_BYTES
        .with_label_values(&["capacity"])
        .set(meta.capacity_bytes as f64);
}
