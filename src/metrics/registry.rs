//! Registers every phase's metrics and reports naming conflicts.

use crate::metrics::{MetricDoc, PhaseMetrics};
use std::collections::HashMap;
use tracing::{debug, warn};

pub fn register_all_metrics() {
    let mut all_metrics = HashMap::new();

    register_phase_metrics::<super::fetch::FetchMetrics>(&mut all_metrics);
    register_phase_metrics::<super::download::DownloadMetrics>(&mut all_metrics);
    register_phase_metrics::<super::state::StateMetrics>(&mut all_metrics);
    register_phase_metrics::<super::run::RunMetrics>(&mut all_metrics);

    debug!("Registered {} metrics across all phases", all_metrics.len());
}

fn register_phase_metrics<T: PhaseMetrics>(all_metrics: &mut HashMap<&'static str, (&'static str, MetricDoc)>) {
    T::register_metrics();
    let phase_name = T::phase_name();
    for doc in T::metrics_documentation() {
        if let Some((existing_phase, _)) = all_metrics.get(doc.name) {
            warn!(
                "Metric name conflict: '{}' is defined by both '{}' and '{}'",
                doc.name, existing_phase, phase_name
            );
        } else {
            all_metrics.insert(doc.name, (phase_name, doc));
        }
    }
}

/// Every documented metric, as listed by `sourcewatch metrics`.
pub fn all_documentation() -> Vec<MetricDoc> {
    let mut docs = Vec::new();
    docs.extend(super::fetch::FetchMetrics::metrics_documentation());
    docs.extend(super::download::DownloadMetrics::metrics_documentation());
    docs.extend(super::state::StateMetrics::metrics_documentation());
    docs.extend(super::run::RunMetrics::metrics_documentation());
    docs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn metric_names_are_unique() {
        let docs = all_documentation();
        let names: HashSet<_> = docs.iter().map(|d| d.name).collect();
        assert_eq!(names.len(), docs.len());
    }

    #[test]
    fn registration_is_idempotent() {
        crate::metrics::init_metrics();
        crate::metrics::init_metrics();
    }
}
