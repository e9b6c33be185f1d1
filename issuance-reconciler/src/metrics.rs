// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_histogram_with_registry,
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry, Histogram,
    HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Registry,
};

const FINE_GRAINED_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.15, 0.2, 0.25, 0.3, 0.35, 0.4, 0.45, 0.5, 0.6, 0.7, 0.8, 0.9,
    1.0, 1.2, 1.4, 1.6, 1.8, 2.0, 2.5, 3.0, 3.5, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10., 15., 20., 25.,
    30., 45., 60., 90., 120., 180., 300.,
];

#[derive(Clone, Debug)]
pub struct ReconcilerMetrics {
    pub(crate) passes: IntCounter,
    pub(crate) pass_failures: IntCounter,
    pub(crate) pass_latency: Histogram,
    pub(crate) last_successful_pass_timestamp: IntGauge,

    pub(crate) unresolved_candidates: IntGauge,
    pub(crate) rows_by_status: IntGaugeVec,

    pub(crate) resolved_total: IntCounter,
    pub(crate) pending_observations: IntCounter,
    pub(crate) no_contract_observations: IntCounterVec,
    pub(crate) failed_total: IntCounterVec,
    pub(crate) integrity_violations: IntCounter,
    pub(crate) skipped_lookups: IntCounter,

    pub(crate) ledger_errors: IntCounterVec,
    pub(crate) store_errors: IntCounterVec,

    pub(crate) eth_rpc_queries: IntCounterVec,
    pub(crate) eth_rpc_queries_latency: HistogramVec,
    pub(crate) eth_node_connected: IntGauge,
}

impl ReconcilerMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            passes: register_int_counter_with_registry!(
                "reconciler_passes",
                "Total number of reconciliation passes started",
                registry,
            )
            .unwrap(),
            pass_failures: register_int_counter_with_registry!(
                "reconciler_pass_failures",
                "Total number of passes abandoned because the store was unavailable",
                registry,
            )
            .unwrap(),
            pass_latency: register_histogram_with_registry!(
                "reconciler_pass_latency",
                "Wall-clock duration of a reconciliation pass",
                FINE_GRAINED_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            last_successful_pass_timestamp: register_int_gauge_with_registry!(
                "reconciler_last_successful_pass_timestamp",
                "Unix timestamp (seconds) of the last completed pass",
                registry,
            )
            .unwrap(),
            unresolved_candidates: register_int_gauge_with_registry!(
                "reconciler_unresolved_candidates",
                "Number of unresolved rows seen at the start of the last pass",
                registry,
            )
            .unwrap(),
            rows_by_status: register_int_gauge_vec_with_registry!(
                "reconciler_rows_by_status",
                "Number of issuance rows per status",
                &["status"],
                registry,
            )
            .unwrap(),
            resolved_total: register_int_counter_with_registry!(
                "reconciler_resolved_total",
                "Total number of issuances resolved with a contract address",
                registry,
            )
            .unwrap(),
            pending_observations: register_int_counter_with_registry!(
                "reconciler_pending_observations",
                "Total number of lookups that found no final receipt yet",
                registry,
            )
            .unwrap(),
            no_contract_observations: register_int_counter_vec_with_registry!(
                "reconciler_no_contract_observations",
                "Total number of final receipts that did not create a contract, by reason",
                &["reason"],
                registry,
            )
            .unwrap(),
            failed_total: register_int_counter_vec_with_registry!(
                "reconciler_failed_total",
                "Total number of issuances moved to the terminal failed status, by reason",
                &["reason"],
                registry,
            )
            .unwrap(),
            integrity_violations: register_int_counter_with_registry!(
                "reconciler_integrity_violations",
                "Total number of rejected attempts to overwrite a resolved row",
                registry,
            )
            .unwrap(),
            skipped_lookups: register_int_counter_with_registry!(
                "reconciler_skipped_lookups",
                "Total number of rows skipped because the pass error budget ran out",
                registry,
            )
            .unwrap(),
            ledger_errors: register_int_counter_vec_with_registry!(
                "reconciler_ledger_errors",
                "Total number of ledger lookup errors, by error type",
                &["type"],
                registry,
            )
            .unwrap(),
            store_errors: register_int_counter_vec_with_registry!(
                "reconciler_store_errors",
                "Total number of store errors, by error type",
                &["type"],
                registry,
            )
            .unwrap(),
            eth_rpc_queries: register_int_counter_vec_with_registry!(
                "reconciler_eth_rpc_queries",
                "Total number of queries issued to eth provider, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            eth_rpc_queries_latency: register_histogram_vec_with_registry!(
                "reconciler_eth_rpc_queries_latency",
                "Latency of queries issued to eth provider, by request type",
                &["type"],
                FINE_GRAINED_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            eth_node_connected: register_int_gauge_with_registry!(
                "reconciler_eth_node_connected",
                "Whether the last eth provider request succeeded (1) or failed (0)",
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once_per_registry() {
        let registry = Registry::new();
        let metrics = ReconcilerMetrics::new(&registry);
        metrics.resolved_total.inc();
        metrics
            .ledger_errors
            .with_label_values(&["transient_provider_error"])
            .inc();

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"reconciler_resolved_total".to_string()));
        assert!(names.contains(&"reconciler_ledger_errors".to_string()));
    }

    #[test]
    #[should_panic]
    fn test_double_registration_panics() {
        let registry = Registry::new();
        let _first = ReconcilerMetrics::new(&registry);
        let _second = ReconcilerMetrics::new(&registry);
    }
}
