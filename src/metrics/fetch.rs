//! Fetch phase metrics: the single source request per run.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct FetchMetrics;

impl FetchMetrics {
    pub fn record_success(source_type: &'static str, duration_secs: f64, bytes: usize) {
        ::metrics::counter!(phase_metric!(counter, "fetch", "requests_success"), "source_type" => source_type)
            .increment(1);
        ::metrics::histogram!(phase_metric!(histogram, "fetch", "duration_seconds")).record(duration_secs);
        ::metrics::histogram!(phase_metric!(histogram, "fetch", "payload_bytes")).record(bytes as f64);
    }

    pub fn record_error(error_type: &'static str) {
        ::metrics::counter!(phase_metric!(counter, "fetch", "requests_error"), "error_type" => error_type)
            .increment(1);
    }
}

impl PhaseMetrics for FetchMetrics {
    fn register_metrics() {
        use metrics::{counter, histogram};

        let _ = counter!(phase_metric!(counter, "fetch", "requests_success"));
        let _ = counter!(phase_metric!(counter, "fetch", "requests_error"));
        let _ = histogram!(phase_metric!(histogram, "fetch", "duration_seconds"));
        let _ = histogram!(phase_metric!(histogram, "fetch", "payload_bytes"));
    }

    fn phase_name() -> &'static str {
        "fetch"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "fetch", "requests_success"),
                metric_type: MetricType::Counter,
                help: "Source documents fetched successfully",
                labels: vec!["source_type"],
            },
            MetricDoc {
                name: phase_metric!(counter, "fetch", "requests_error"),
                metric_type: MetricType::Counter,
                help: "Source fetches that aborted a run",
                labels: vec!["error_type"],
            },
            MetricDoc {
                name: phase_metric!(histogram, "fetch", "duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Duration of the source request",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(histogram, "fetch", "payload_bytes"),
                metric_type: MetricType::Histogram,
                help: "Size of the fetched source document",
                labels: vec![],
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documentation_uses_prefix() {
        FetchMetrics::register_metrics();
        let docs = FetchMetrics::metrics_documentation();
        assert_eq!(docs.len(), 4);
        assert!(docs.iter().all(|d| d.name.starts_with("sourcewatch_fetch_")));
    }
}
