//! Dedup store and transform cache metrics.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct StateMetrics;

impl StateMetrics {
    pub fn record_cache_hit() {
        ::metrics::counter!(phase_metric!(counter, "state", "cache_hits")).increment(1);
    }

    pub fn record_cache_miss() {
        ::metrics::counter!(phase_metric!(counter, "state", "cache_misses")).increment(1);
    }

    pub fn record_saved(n: usize) {
        ::metrics::counter!(phase_metric!(counter, "state", "events_saved")).increment(n as u64);
    }

    pub fn record_known(n: usize) {
        ::metrics::counter!(phase_metric!(counter, "state", "events_known")).increment(n as u64);
    }

    pub fn record_store_error() {
        ::metrics::counter!(phase_metric!(counter, "state", "store_errors")).increment(1);
    }
}

impl PhaseMetrics for StateMetrics {
    fn register_metrics() {
        use metrics::counter;

        let _ = counter!(phase_metric!(counter, "state", "cache_hits"));
        let _ = counter!(phase_metric!(counter, "state", "cache_misses"));
        let _ = counter!(phase_metric!(counter, "state", "events_saved"));
        let _ = counter!(phase_metric!(counter, "state", "events_known"));
        let _ = counter!(phase_metric!(counter, "state", "store_errors"));
    }

    fn phase_name() -> &'static str {
        "state"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        let counter = |name, help| MetricDoc {
            name,
            metric_type: MetricType::Counter,
            help,
            labels: vec![],
        };
        vec![
            counter(phase_metric!(counter, "state", "cache_hits"), "Transform cache hits"),
            counter(phase_metric!(counter, "state", "cache_misses"), "Transform cache misses"),
            counter(phase_metric!(counter, "state", "events_saved"), "New events persisted"),
            counter(phase_metric!(counter, "state", "events_known"), "Records rejected as already known"),
            counter(phase_metric!(counter, "state", "store_errors"), "Dedup store or cache failures"),
        ]
    }
}
