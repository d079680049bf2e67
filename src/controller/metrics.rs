//! Prometheus metrics for the pair scheduler
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `pair_scheduler_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `pair_scheduler_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `pair_scheduler_pair_claims_total` (counter): pairs bound to a tenant, labeled by claim path.
//! - `pair_scheduler_pair_claim_conflicts_total` (counter): candidate pairs abandoned because another tenant holds the record.
//! - `pair_scheduler_placeholder_operations_total` (counter): placeholder applies and deletes labeled by flavor and operation.
//! - `pair_scheduler_reaped_nodes_total` (counter): nodes deleted because their tenant no longer exists.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub controller: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    pub kind: String,
}

/// Labels for pair claims
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClaimLabels {
    /// "backfill", "warm_pool" or "tenant_placeholder"
    pub path: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PlaceholderLabels {
    /// "warm_pool" or "tenant"
    pub flavor: String,
    /// "apply" or "delete"
    pub operation: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static PAIR_CLAIMS_TOTAL: Lazy<Family<ClaimLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static PAIR_CLAIM_CONFLICTS_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);

pub static PLACEHOLDER_OPERATIONS_TOTAL: Lazy<
    Family<PlaceholderLabels, Counter<u64, AtomicU64>>,
> = Lazy::new(Family::default);

pub static REAPED_NODES_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);

pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "pair_scheduler_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "pair_scheduler_reconcile_errors",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "pair_scheduler_pair_claims",
        "Node pairs bound to a tenant",
        PAIR_CLAIMS_TOTAL.clone(),
    );
    registry.register(
        "pair_scheduler_pair_claim_conflicts",
        "Candidate pairs abandoned because another tenant holds the record",
        PAIR_CLAIM_CONFLICTS_TOTAL.clone(),
    );
    registry.register(
        "pair_scheduler_placeholder_operations",
        "Placeholder deployments applied or deleted",
        PLACEHOLDER_OPERATIONS_TOTAL.clone(),
    );
    registry.register(
        "pair_scheduler_reaped_nodes",
        "Dedicated nodes deleted because their tenant is gone",
        REAPED_NODES_TOTAL.clone(),
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

pub fn inc_pair_claim(path: &str) {
    let labels = ClaimLabels {
        path: path.to_string(),
    };
    PAIR_CLAIMS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_pair_claim_conflict() {
    PAIR_CLAIM_CONFLICTS_TOTAL.inc();
}

pub fn inc_placeholder_operation(flavor: &str, operation: &str) {
    let labels = PlaceholderLabels {
        flavor: flavor.to_string(),
        operation: operation.to_string(),
    };
    PLACEHOLDER_OPERATIONS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_reaped_node() {
    REAPED_NODES_TOTAL.inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_registry_encodes_claims() {
        inc_pair_claim("warm_pool");
        inc_placeholder_operation("tenant", "delete");

        let mut buffer = String::new();
        encode(&mut buffer, &REGISTRY).unwrap();
        assert!(buffer.contains("pair_scheduler_pair_claims_total{path=\"warm_pool\"}"));
        assert!(buffer.contains("pair_scheduler_reaped_nodes_total"));
    }
}
