use crate::controller::ControllerId;

use std::collections::HashMap;
use std::sync::Arc;

use opentelemetry::trace::TraceId;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::time::Instant;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ControllerLabels {
    pub controller: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TriggerLabels {
    pub controller: String,
    pub triggered_by: String,
}

/// Metric families shared by every controller, labeled by controller id.
#[derive(Clone)]
struct Families {
    reconcile_operations: Family<ControllerLabels, Counter>,
    reconcile_failures: Family<ControllerLabels, Counter>,
    reconcile_duration: Family<ControllerLabels, Histogram>,
    triggered: Family<TriggerLabels, Counter>,
    watch_operations_failed: Family<ControllerLabels, Counter>,
    ready: Family<ControllerLabels, Gauge>,
}

impl Families {
    fn register(registry: &mut Registry) -> Self {
        let reconcile_operations = Family::<ControllerLabels, Counter>::default();
        registry.register(
            "reconcile_operations",
            "Total number of reconcile operations",
            reconcile_operations.clone(),
        );

        let reconcile_failures = Family::<ControllerLabels, Counter>::default();
        registry.register(
            "reconcile_failures",
            "Number of errors that occurred during reconcile operations",
            reconcile_failures.clone(),
        );

        let reconcile_duration = Family::<ControllerLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.005, 2.0, 12))
        });
        registry.register(
            "reconcile_duration_seconds",
            "Histogram of reconcile operations",
            reconcile_duration.clone(),
        );

        let triggered = Family::<TriggerLabels, Counter>::default();
        registry.register(
            "triggered",
            "Number of watch events that triggered the reconciliation of an object",
            triggered.clone(),
        );

        let watch_operations_failed = Family::<ControllerLabels, Counter>::default();
        registry.register(
            "watch_operations_failed",
            "Total number of watch operations that failed",
            watch_operations_failed.clone(),
        );

        let ready = Family::<ControllerLabels, Gauge>::default();
        registry.register(
            "ready",
            "1 when the controller is ready to reconcile resources, 0 otherwise",
            ready.clone(),
        );

        Self {
            reconcile_operations,
            reconcile_failures,
            reconcile_duration,
            triggered,
            watch_operations_failed,
            ready,
        }
    }
}

pub struct Metrics {
    pub registry: Arc<Registry>,
    pub controllers: HashMap<ControllerId, Arc<ControllerMetrics>>,
}

impl Metrics {
    pub fn new(mut registry: Registry, controller_names: &[&'static str]) -> Self {
        let families = Families::register(&mut registry);
        let controllers = controller_names
            .iter()
            .map(|&id| {
                (
                    id,
                    Arc::new(ControllerMetrics {
                        labels: ControllerLabels {
                            controller: id.to_string(),
                        },
                        families: families.clone(),
                    }),
                )
            })
            .collect();

        Self {
            registry: Arc::new(registry),
            controllers,
        }
    }
}

#[derive(Clone)]
pub struct ControllerMetrics {
    labels: ControllerLabels,
    families: Families,
}

impl ControllerMetrics {
    pub fn reconcile_failure_inc(&self) {
        self.families
            .reconcile_failures
            .get_or_create(&self.labels)
            .inc();
    }

    pub fn reconcile_count_and_measure(&self, _trace_id: &TraceId) -> ReconcileMeasurer {
        self.families
            .reconcile_operations
            .get_or_create(&self.labels)
            .inc();
        ReconcileMeasurer {
            start: Instant::now(),
            labels: self.labels.clone(),
            metric: self.families.reconcile_duration.clone(),
        }
    }

    pub fn triggered_inc(&self, triggered_by: &str) {
        self.families
            .triggered
            .get_or_create(&TriggerLabels {
                controller: self.labels.controller.clone(),
                triggered_by: triggered_by.to_string(),
            })
            .inc();
    }

    pub fn watch_operations_failed_inc(&self) {
        self.families
            .watch_operations_failed
            .get_or_create(&self.labels)
            .inc();
    }

    pub fn ready_set(&self, status: i64) {
        self.families.ready.get_or_create(&self.labels).set(status);
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    labels: ControllerLabels,
    metric: Family<ControllerLabels, Histogram>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.metric.get_or_create(&self.labels).observe(duration);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_controllers_are_registered() {
        let metrics = Metrics::new(Registry::default(), &["install", "monitor"]);
        assert!(metrics.controllers.contains_key("install"));
        assert!(metrics.controllers.contains_key("monitor"));
        assert!(!metrics.controllers.contains_key("unknown"));
    }

    #[test]
    fn test_ready_and_failure_counters() {
        let metrics = Metrics::new(Registry::default(), &["install"]);
        let install = metrics.controllers.get("install").unwrap();
        install.ready_set(1);
        install.reconcile_failure_inc();
        install.triggered_inc("HostDescriptor");

        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &metrics.registry).unwrap();
        assert!(buffer.contains("reconcile_failures_total{controller=\"install\"} 1"));
        assert!(buffer.contains("ready{controller=\"install\"} 1"));
    }
}
