//! Run-level metrics: runs, per-stage duration and record counts.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct RunMetrics;

impl RunMetrics {
    pub fn record_run_started() {
        ::metrics::counter!(phase_metric!(counter, "run", "started")).increment(1);
    }

    pub fn record_run_finished(success: bool, duration_secs: f64) {
        let outcome = if success { "success" } else { "error" };
        ::metrics::counter!(phase_metric!(counter, "run", "finished"), "outcome" => outcome).increment(1);
        ::metrics::histogram!(phase_metric!(histogram, "run", "duration_seconds")).record(duration_secs);
    }

    pub fn record_stage(stage: &'static str, duration_secs: f64, records: usize) {
        ::metrics::histogram!(phase_metric!(histogram, "run", "stage_duration_seconds"), "stage" => stage)
            .record(duration_secs);
        ::metrics::histogram!(phase_metric!(histogram, "run", "stage_records"), "stage" => stage)
            .record(records as f64);
    }
}

impl PhaseMetrics for RunMetrics {
    fn register_metrics() {
        use metrics::{counter, histogram};

        let _ = counter!(phase_metric!(counter, "run", "started"));
        let _ = counter!(phase_metric!(counter, "run", "finished"));
        let _ = histogram!(phase_metric!(histogram, "run", "duration_seconds"));
        let _ = histogram!(phase_metric!(histogram, "run", "stage_duration_seconds"));
        let _ = histogram!(phase_metric!(histogram, "run", "stage_records"));
    }

    fn phase_name() -> &'static str {
        "run"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "run", "started"),
                metric_type: MetricType::Counter,
                help: "Pipeline runs started",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "run", "finished"),
                metric_type: MetricType::Counter,
                help: "Pipeline runs finished",
                labels: vec!["outcome"],
            },
            MetricDoc {
                name: phase_metric!(histogram, "run", "duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Wall time of a whole run",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(histogram, "run", "stage_duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Wall time per stage",
                labels: vec!["stage"],
            },
            MetricDoc {
                name: phase_metric!(histogram, "run", "stage_records"),
                metric_type: MetricType::Histogram,
                help: "Records in the context after each stage",
                labels: vec!["stage"],
            },
        ]
    }
}
