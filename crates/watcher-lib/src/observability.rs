//! Service self-metrics
//!
//! Prometheus gauges and counters describing the watcher itself, exported
//! by the service's `/metrics` endpoint.

use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;

/// Histogram buckets for provider fetch latency (in seconds)
const FETCH_LATENCY_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ServiceMetricsInner> = OnceLock::new();

struct ServiceMetricsInner {
    poll_cycles: IntCounter,
    fetch_errors: IntCounter,
    fetch_latency_seconds: Histogram,
    cache_entries: IntGauge,
}

impl ServiceMetricsInner {
    fn new() -> Self {
        Self {
            poll_cycles: register_int_counter!(
                "watcher_poll_cycles_total",
                "Total number of provider poll cycles attempted"
            )
            .expect("Failed to register poll_cycles_total"),

            fetch_errors: register_int_counter!(
                "watcher_fetch_errors_total",
                "Total number of failed provider fetches"
            )
            .expect("Failed to register fetch_errors_total"),

            fetch_latency_seconds: register_histogram!(
                "watcher_fetch_latency_seconds",
                "Time spent fetching metrics from the provider",
                FETCH_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register fetch_latency_seconds"),

            cache_entries: register_int_gauge!(
                "watcher_cache_entries",
                "Number of snapshots currently held in the sliding cache"
            )
            .expect("Failed to register cache_entries"),
        }
    }
}

/// Cloneable handle over the process-wide metrics registry.
#[derive(Clone)]
pub struct ServiceMetrics;

impl ServiceMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ServiceMetricsInner::new);
        Self
    }

    fn inner(&self) -> &'static ServiceMetricsInner {
        GLOBAL_METRICS.get_or_init(ServiceMetricsInner::new)
    }

    pub fn inc_poll_cycles(&self) {
        self.inner().poll_cycles.inc();
    }

    pub fn inc_fetch_errors(&self) {
        self.inner().fetch_errors.inc();
    }

    pub fn observe_fetch_latency(&self, seconds: f64) {
        self.inner().fetch_latency_seconds.observe(seconds);
    }

    pub fn set_cache_entries(&self, entries: i64) {
        self.inner().cache_entries.set(entries);
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_once_and_record() {
        let metrics = ServiceMetrics::new();
        metrics.inc_poll_cycles();
        metrics.inc_fetch_errors();
        metrics.observe_fetch_latency(0.123);
        metrics.set_cache_entries(7);

        // A second handle shares the same registry without panicking on
        // duplicate registration.
        let other = ServiceMetrics::new();
        other.inc_poll_cycles();

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|family| family.get_name() == "watcher_poll_cycles_total"));
        assert!(families
            .iter()
            .any(|family| family.get_name() == "watcher_cache_entries"));
    }
}
