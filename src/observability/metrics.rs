//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `riff_reconciliations_total{kind}` - Total number of reconciliations
//! - `riff_reconciliation_errors_total{kind}` - Reconciliations that ended in a hard error
//! - `riff_reconciliation_duration_seconds{kind}` - Duration of reconciliations
//! - `riff_status_updates_total{kind}` - Status subresource writes issued
//! - `riff_status_update_conflicts_total{kind}` - Status writes rejected as stale
//! - `riff_child_operations_total{verb,kind}` - Child creates, updates and deletes
//! - `riff_requeues_total{reason}` - Requeues by reason
//! - `riff_tracker_lookups_total{kind}` - Tracker lookups triggered by watched dependencies
//! - `riff_tracker_fanout` - Resources re-enqueued per tracker lookup
//! - `riff_outbound_requests_total{target,outcome}` - Calls to image registries and the stream provisioner

use anyhow::Result;
use prometheus::{Histogram, HistogramVec, IntCounterVec, Registry};
use std::sync::LazyLock;

// Metrics
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new("riff_reconciliations_total", "Total number of reconciliations"),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "riff_reconciliation_errors_total",
            "Total number of reconciliation errors",
        ),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "riff_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static STATUS_UPDATES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new("riff_status_updates_total", "Total number of status updates"),
        &["kind"],
    )
    .expect("Failed to create STATUS_UPDATES_TOTAL metric - this should never happen")
});

static STATUS_UPDATE_CONFLICTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "riff_status_update_conflicts_total",
            "Total number of status updates rejected with a stale resourceVersion",
        ),
        &["kind"],
    )
    .expect("Failed to create STATUS_UPDATE_CONFLICTS_TOTAL metric - this should never happen")
});

static CHILD_OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "riff_child_operations_total",
            "Total number of child object writes by verb and kind",
        ),
        &["verb", "kind"],
    )
    .expect("Failed to create CHILD_OPERATIONS_TOTAL metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new("riff_requeues_total", "Total number of requeues by reason"),
        &["reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static TRACKER_LOOKUPS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "riff_tracker_lookups_total",
            "Total number of tracker lookups by tracked kind",
        ),
        &["kind"],
    )
    .expect("Failed to create TRACKER_LOOKUPS_TOTAL metric - this should never happen")
});

static TRACKER_FANOUT: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "riff_tracker_fanout",
            "Number of resources re-enqueued per tracker lookup",
        )
        .buckets(vec![0.0, 1.0, 2.0, 5.0, 10.0, 50.0, 100.0]),
    )
    .expect("Failed to create TRACKER_FANOUT metric - this should never happen")
});

static OUTBOUND_REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "riff_outbound_requests_total",
            "Total number of HTTP calls made outside the cluster API by target and outcome",
        ),
        &["target", "outcome"],
    )
    .expect("Failed to create OUTBOUND_REQUESTS_TOTAL metric - this should never happen")
});

#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(STATUS_UPDATES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STATUS_UPDATE_CONFLICTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CHILD_OPERATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TRACKER_LOOKUPS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TRACKER_FANOUT.clone()))?;
    REGISTRY.register(Box::new(OUTBOUND_REQUESTS_TOTAL.clone()))?;

    Ok(())
}

pub fn increment_reconciliations(kind: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_reconciliation_errors(kind: &str) {
    RECONCILIATION_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn observe_reconciliation_duration(kind: &str, duration: f64) {
    RECONCILIATION_DURATION.with_label_values(&[kind]).observe(duration);
}

pub fn increment_status_updates(kind: &str) {
    STATUS_UPDATES_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_status_update_conflicts(kind: &str) {
    STATUS_UPDATE_CONFLICTS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_child_operations(verb: &str, kind: &str) {
    CHILD_OPERATIONS_TOTAL.with_label_values(&[verb, kind]).inc();
}

pub fn increment_requeues(reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_tracker_lookup(kind: &str, fanout: usize) {
    TRACKER_LOOKUPS_TOTAL.with_label_values(&[kind]).inc();
    #[allow(clippy::cast_precision_loss, reason = "fan-out counts are small")]
    TRACKER_FANOUT.observe(fanout as f64);
}

/// `outcome` is `success` or `error`
pub fn increment_outbound_requests(target: &str, outcome: &str) {
    OUTBOUND_REQUESTS_TOTAL.with_label_values(&[target, outcome]).inc();
}
