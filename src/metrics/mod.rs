//! Phase-organized metrics for the pipeline
//!
//! Each phase owns a submodule with its recording helpers, registration and
//! documentation. Recording goes through the `metrics` facade; whichever recorder the
//! host process installs receives the values, and without one they are no-ops.

pub mod download;
pub mod fetch;
pub mod registry;
pub mod run;
pub mod state;

pub use download::DownloadMetrics;
pub use fetch::FetchMetrics;
pub use run::RunMetrics;
pub use state::StateMetrics;

use std::sync::Once;

static INIT: Once = Once::new();

/// Register all phase metrics once per process. Idempotent.
pub fn init_metrics() {
    INIT.call_once(registry::register_all_metrics);
}

/// Trait for phase-specific metrics collections
pub trait PhaseMetrics {
    /// Register all metrics for this phase
    fn register_metrics();

    /// Get the phase name for prefixing metrics
    fn phase_name() -> &'static str;

    /// Get documentation for all metrics in this phase
    fn metrics_documentation() -> Vec<MetricDoc>;
}

/// Documentation for a single metric
#[derive(Debug, Clone)]
pub struct MetricDoc {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub help: &'static str,
    pub labels: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Histogram,
}

/// Builds `sourcewatch_{phase}_{name}` (counters get a `_total` suffix).
macro_rules! phase_metric {
    (counter, $phase:literal, $name:literal) => {
        concat!("sourcewatch_", $phase, "_", $name, "_total")
    };
    (histogram, $phase:literal, $name:literal) => {
        concat!("sourcewatch_", $phase, "_", $name)
    };
}

pub(crate) use phase_metric;
