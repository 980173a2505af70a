// Prometheus metrics registry and collectors
// Author: kelexine (https://github.com/kelexine)

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, GaugeVec, HistogramVec, Opts, Registry, TextEncoder, Encoder,
    register_counter_vec_with_registry, register_gauge_vec_with_registry,
    register_histogram_vec_with_registry,
};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // CACHE METRICS
    // ============================================================================

    /// Cache operations
    pub static ref CACHE_OPERATIONS: CounterVec = register_counter_vec_with_registry!(
        Opts::new("gencache_operations_total", "Total response cache operations"),
        &["operation"], // operation: hit, miss, store, evict, coalesced, degraded, corrupt
        REGISTRY
    ).unwrap();

    /// Store usage as last observed by this process
    pub static ref STORE_BYTES: GaugeVec = register_gauge_vec_with_registry!(
        Opts::new("gencache_store_bytes", "Response store usage in bytes"),
        &["kind"], // kind: used, capacity
        REGISTRY
    ).unwrap();

    // ============================================================================
    // GENERATION METRICS
    // ============================================================================

    /// Duration of calls to the external generation function
    pub static ref GENERATION_DURATION: HistogramVec = register_histogram_vec_with_registry!(
        prometheus::HistogramOpts::new(
            "gencache_generation_duration_seconds",
            "External generation call duration"
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["operation", "status"], // status: success, failure
        REGISTRY
    ).unwrap();
}

/// Gather all metrics and return as Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        CACHE_OPERATIONS.with_label_values(&["hit"]).inc();
        STORE_BYTES.with_label_values(&["used"]).set(1.0);
        GENERATION_DURATION.with_label_values(&["lookup_drug", "success"]).observe(0.2);

        let metrics = gather_metrics();
        assert!(metrics.contains("gencache_operations_total"));
        assert!(metrics.contains("gencache_store_bytes"));
        assert!(metrics.contains("gencache_generation_duration_seconds"));
    }
}
