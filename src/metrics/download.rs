//! Download phase metrics: attempts, outcomes and TLS fallbacks.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct DownloadMetrics;

impl DownloadMetrics {
    pub fn record_attempt() {
        ::metrics::counter!(phase_metric!(counter, "download", "attempts")).increment(1);
    }

    pub fn record_tls_fallback() {
        ::metrics::counter!(phase_metric!(counter, "download", "tls_fallbacks")).increment(1);
    }

    pub fn record_outcomes(status: &'static str, n: usize) {
        ::metrics::counter!(phase_metric!(counter, "download", "outcomes"), "status" => status).increment(n as u64);
    }

    pub fn record_bytes(bytes: usize) {
        ::metrics::histogram!(phase_metric!(histogram, "download", "payload_bytes")).record(bytes as f64);
    }
}

impl PhaseMetrics for DownloadMetrics {
    fn register_metrics() {
        use metrics::{counter, histogram};

        let _ = counter!(phase_metric!(counter, "download", "attempts"));
        let _ = counter!(phase_metric!(counter, "download", "tls_fallbacks"));
        let _ = counter!(phase_metric!(counter, "download", "outcomes"));
        let _ = histogram!(phase_metric!(histogram, "download", "payload_bytes"));
    }

    fn phase_name() -> &'static str {
        "download"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "download", "attempts"),
                metric_type: MetricType::Counter,
                help: "Download attempts, including retries",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "download", "tls_fallbacks"),
                metric_type: MetricType::Counter,
                help: "Attempts repeated without TLS verification",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "download", "outcomes"),
                metric_type: MetricType::Counter,
                help: "Per-record download outcomes",
                labels: vec!["status"],
            },
            MetricDoc {
                name: phase_metric!(histogram, "download", "payload_bytes"),
                metric_type: MetricType::Histogram,
                help: "Size of downloaded assets",
                labels: vec![],
            },
        ]
    }
}
