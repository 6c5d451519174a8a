//! Prometheus metrics for the PgHero operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `pghero_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `pghero_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `pghero_configmap_conflicts_total` (counter): lost ConfigMap compare-and-swap writes labeled by namespace.
//! - `pghero_configmap_databases` (gauge): entries rendered into the ConfigMap labeled by namespace.
//! - `pghero_database_phase` (gauge): 1 for the current phase of each Database, 0 for the others.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::crd::Phase;

const PHASES: [Phase; 4] = [Phase::Pending, Phase::Configuring, Phase::Ready, Phase::Error];

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "database"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind, see [`crate::Error::metric_label`]
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NamespaceLabels {
    pub namespace: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
    pub namespace: String,
    pub name: String,
    pub phase: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking ConfigMap writes that lost against a concurrent writer
pub static CONFIGMAP_CONFLICTS_TOTAL: Lazy<Family<NamespaceLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Gauge tracking the number of databases rendered per namespace
pub static CONFIGMAP_DATABASES: Lazy<Family<NamespaceLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Gauge set to 1 for the current phase of a Database
pub static DATABASE_PHASE: Lazy<Family<PhaseLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    // Counters get their `_total` suffix from the encoder.
    let mut registry = Registry::default();

    registry.register(
        "pghero_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "pghero_reconcile_errors",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "pghero_configmap_conflicts",
        "ConfigMap writes rejected because of a concurrent update",
        CONFIGMAP_CONFLICTS_TOTAL.clone(),
    );
    registry.register(
        "pghero_configmap_databases",
        "Number of databases rendered into the PgHero ConfigMap",
        CONFIGMAP_DATABASES.clone(),
    );
    registry.register(
        "pghero_database_phase",
        "Current reconcile phase of a Database (1 = active)",
        DATABASE_PHASE.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_configmap_conflict(namespace: &str) {
    let labels = NamespaceLabels {
        namespace: namespace.to_string(),
    };
    CONFIGMAP_CONFLICTS_TOTAL.get_or_create(&labels).inc();
}

pub fn set_configmap_databases(namespace: &str, count: usize) {
    let labels = NamespaceLabels {
        namespace: namespace.to_string(),
    };
    CONFIGMAP_DATABASES.get_or_create(&labels).set(count as i64);
}

/// Record the current phase of a Database; the other phases drop to 0.
pub fn set_database_phase(namespace: &str, name: &str, phase: Phase) {
    for candidate in PHASES {
        let labels = PhaseLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
            phase: candidate.to_string(),
        };
        DATABASE_PHASE
            .get_or_create(&labels)
            .set(i64::from(candidate == phase));
    }
}

/// Forget a deleted Database so its series stop being exported.
pub fn clear_database_phase(namespace: &str, name: &str) {
    for candidate in PHASES {
        let labels = PhaseLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
            phase: candidate.to_string(),
        };
        DATABASE_PHASE.remove(&labels);
    }
}
