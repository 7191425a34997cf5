use std::{
    borrow::Cow,
    sync::{LazyLock, PoisonError, RwLock},
};

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time::Instant;

use crate::{Error, dispatcher::EventKind};

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("edge_autogw")));

#[derive(Clone)]
pub struct ControllerMetrics {
    pub runs: Family<ControllerLabels, Counter>,
    pub failures: Family<ErrorLabels, Counter>,
    pub duration: Histogram,
}

impl ControllerMetrics {
    /// Register controller metrics to start tracking them.
    pub fn new(controller_name: &str) -> Self {
        let mut guard = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
        let registry = guard.sub_registry_with_label((
            Cow::Borrowed("controller_name"),
            Cow::Owned(controller_name.into()),
        ));
        let runs = Family::<ControllerLabels, Counter>::default();
        let failures = Family::<ErrorLabels, Counter>::default();
        let duration = Histogram::new([0.01, 0.1, 0.25, 0.5, 1.0, 5.0, 15.0, 60.0].into_iter());

        registry.register_with_unit(
            "reconcile_duration",
            "reconcile duration",
            Unit::Seconds,
            duration.clone(),
        );
        registry.register(
            "reconcile_failures",
            "Number of reconciliation errors",
            failures.clone(),
        );
        registry.register("reconcile_runs", "Number of reconciliations", runs.clone());
        Self {
            runs,
            failures,
            duration,
        }
    }

    pub fn count_failure(&self, event: EventKind, e: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                event: event.as_str().into(),
                error: e.metric_label(),
            })
            .inc();
    }

    pub fn count_and_measure(&self, event: EventKind) -> ReconcileMeasurer {
        self.runs
            .get_or_create(&ControllerLabels {
                event: event.as_str().into(),
            })
            .inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.duration.clone(),
        }
    }
}

pub struct ReconcileMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.observe(duration);
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ControllerLabels {
    pub event: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub event: String,
    pub error: String,
}
