// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Reconciliation loop
//!
//! Periodically selects every pending issuance without a contract address, looks up the
//! receipt of its deploy transaction and writes the outcome back to the store.
//!
//! ## Outcomes per row
//! - `Pending`: left untouched, looked up again next pass
//! - contract created: deployer and contract address persisted, row turns `resolved`
//! - no contract created: observation counted, row turns `failed` at the configured cap
//! - malformed hash: row turns `failed` right away
//! - ledger error: left untouched, counted against the pass error budget
//!
//! Lookups run concurrently, writes are applied one at a time as lookups complete.
//! A write that finds the store unreachable abandons the rest of the pass.
//! Shutdown is only observed between passes.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use issuance_schema::models::{IssuanceStatus, PendingIssuance};
use serde::Serialize;
use strum::IntoEnumIterator;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ReconcileError, ReconcileResult};
use crate::ledger_client::{LedgerClient, ReceiptOutcome};
use crate::metrics::ReconcilerMetrics;
use crate::store::{IssuanceStore, NoContractOutcome, ResolveOutcome};

pub const INVALID_TX_HASH_REASON: &str = "invalid_tx_hash";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Sleep between passes
    pub poll_interval: Duration,
    /// Final no-contract receipts tolerated before a row turns `failed`
    pub max_no_contract_observations: u32,
    /// Receipt lookups in flight at once
    pub max_concurrent_lookups: usize,
    /// Ledger errors tolerated in one pass before the remaining rows are skipped.
    /// Zero disables the budget.
    pub pass_error_budget: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_no_contract_observations: 3,
            max_concurrent_lookups: 4,
            pass_error_budget: 10,
        }
    }
}

/// Counters for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub candidates: usize,
    pub resolved: usize,
    pub already_resolved: usize,
    pub pending: usize,
    pub no_contract: usize,
    pub failed: usize,
    pub transient_errors: usize,
    pub store_errors: usize,
    pub skipped: usize,
    pub conflicts: usize,
}

pub struct Reconciler<L, S> {
    ledger: Arc<L>,
    store: Arc<S>,
    config: ReconcilerConfig,
    metrics: Arc<ReconcilerMetrics>,
}

impl<L, S> Reconciler<L, S>
where
    L: LedgerClient,
    S: IssuanceStore,
{
    pub fn new(
        ledger: Arc<L>,
        store: Arc<S>,
        config: ReconcilerConfig,
        metrics: Arc<ReconcilerMetrics>,
    ) -> Self {
        Self {
            ledger,
            store,
            config,
            metrics,
        }
    }

    /// Run passes until `cancel` fires. Errors never end the loop.
    pub async fn run(self, cancel: CancellationToken) {
        info!("[Reconciler] Starting reconciliation loop");
        info!("  Poll interval: {:?}", self.config.poll_interval);
        info!(
            "  Max no-contract observations: {}",
            self.config.max_no_contract_observations
        );
        info!(
            "  Max concurrent lookups: {}",
            self.config.max_concurrent_lookups
        );
        info!("  Pass error budget: {}", self.config.pass_error_budget);

        loop {
            // Failures are logged and metered inside run_pass.
            let _ = self.run_pass().await;

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[Reconciler] Shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// One full pass over the current unresolved set. Fails when the candidate set
    /// cannot be read or the store becomes unreachable mid-pass; other row level
    /// errors are absorbed into the summary.
    pub async fn run_pass(&self) -> ReconcileResult<PassSummary> {
        self.metrics.passes.inc();
        let _timer = self.metrics.pass_latency.start_timer();

        let candidates = match self.store.select_unresolved().await {
            Ok(candidates) => candidates,
            Err(e) => {
                self.record_store_error(&e);
                self.metrics.pass_failures.inc();
                error!(
                    "[Reconciler] Failed to select unresolved issuances, abandoning pass: {}",
                    e
                );
                return Err(e);
            }
        };

        let mut summary = PassSummary {
            candidates: candidates.len(),
            ..Default::default()
        };
        self.metrics
            .unresolved_candidates
            .set(candidates.len() as i64);
        debug!(
            "[Reconciler] Pass started with {} candidates",
            summary.candidates
        );

        let ledger = &self.ledger;
        let mut lookups = futures::stream::iter(candidates)
            .map(|row| async move {
                let result = ledger.fetch_receipt(&row.transaction_hash).await;
                (row, result)
            })
            .buffer_unordered(self.config.max_concurrent_lookups.max(1));

        let mut processed = 0;
        let mut outage = None;
        while let Some((row, result)) = lookups.next().await {
            processed += 1;
            if let Err(e) = self.apply(&row, result, &mut summary).await {
                outage = Some(e);
                break;
            }

            if self.budget_exhausted(&summary) {
                warn!(
                    "[Reconciler] Pass error budget exhausted after {} ledger errors, skipping remaining rows",
                    summary.transient_errors
                );
                break;
            }
        }
        drop(lookups);

        summary.skipped = summary.candidates - processed;
        self.metrics.skipped_lookups.inc_by(summary.skipped as u64);

        if let Some(e) = outage {
            self.metrics.pass_failures.inc();
            error!(
                "[Reconciler] Store unreachable, abandoning pass with {} rows skipped: {}",
                summary.skipped, e
            );
            return Err(e);
        }

        self.refresh_status_gauges().await;
        self.metrics
            .last_successful_pass_timestamp
            .set(unix_now_secs());

        if summary.candidates > 0 {
            info!("[Reconciler] Pass complete: {:?}", summary);
        }
        Ok(summary)
    }

    fn budget_exhausted(&self, summary: &PassSummary) -> bool {
        self.config.pass_error_budget > 0
            && summary.transient_errors >= self.config.pass_error_budget
    }

    async fn apply(
        &self,
        row: &PendingIssuance,
        result: ReconcileResult<ReceiptOutcome>,
        summary: &mut PassSummary,
    ) -> ReconcileResult<()> {
        let tx_hash = row.transaction_hash.as_str();
        match result {
            Ok(ReceiptOutcome::Pending) => {
                summary.pending += 1;
                self.metrics.pending_observations.inc();
                debug!("[Reconciler] Transaction {} not final yet", tx_hash);
            }
            Ok(ReceiptOutcome::ConfirmedContract {
                deployer,
                contract,
                block_number,
            }) => {
                return self
                    .apply_contract(row, &deployer, &contract, block_number, summary)
                    .await;
            }
            Ok(ReceiptOutcome::ConfirmedNoContract {
                deployer,
                block_number,
                reason,
            }) => {
                summary.no_contract += 1;
                self.metrics
                    .no_contract_observations
                    .with_label_values(&[reason.as_ref()])
                    .inc();
                match self
                    .store
                    .record_no_contract(
                        tx_hash,
                        reason.as_ref(),
                        self.config.max_no_contract_observations,
                    )
                    .await
                {
                    Ok(NoContractOutcome::StillPending { observations }) => {
                        warn!(
                            "[Reconciler] Transaction {} from {} in block {} created no contract ({}), observation {}/{}",
                            tx_hash,
                            deployer,
                            block_number,
                            reason,
                            observations,
                            self.config.max_no_contract_observations
                        );
                    }
                    Ok(NoContractOutcome::Failed { observations }) => {
                        summary.failed += 1;
                        self.metrics
                            .failed_total
                            .with_label_values(&[reason.as_ref()])
                            .inc();
                        error!(
                            "[Reconciler] Issuance {} marked failed: transaction from {} in block {} created no contract ({}) after {} observations",
                            tx_hash, deployer, block_number, reason, observations
                        );
                    }
                    Ok(NoContractOutcome::NotFound) => {
                        warn!(
                            "[Reconciler] Issuance {} no longer pending, no-contract observation dropped",
                            tx_hash
                        );
                    }
                    Err(e) => return self.on_write_error(tx_hash, e, summary),
                }
            }
            Err(ReconcileError::InvalidTxHash(_)) => {
                match self.store.mark_failed(tx_hash, INVALID_TX_HASH_REASON).await {
                    Ok(true) => {
                        summary.failed += 1;
                        self.metrics
                            .failed_total
                            .with_label_values(&[INVALID_TX_HASH_REASON])
                            .inc();
                        error!(
                            "[Reconciler] Issuance {} (id {}) marked failed: malformed transaction hash",
                            tx_hash, row.id
                        );
                    }
                    Ok(false) => {
                        debug!(
                            "[Reconciler] Issuance {} already left the pending state",
                            tx_hash
                        );
                    }
                    Err(e) => return self.on_write_error(tx_hash, e, summary),
                }
            }
            Err(e) => {
                summary.transient_errors += 1;
                self.metrics
                    .ledger_errors
                    .with_label_values(&[e.error_type()])
                    .inc();
                warn!(
                    "[Reconciler] Receipt lookup for {} failed, retrying next pass: {}",
                    tx_hash, e
                );
            }
        }
        Ok(())
    }

    async fn apply_contract(
        &self,
        row: &PendingIssuance,
        deployer: &str,
        contract: &str,
        block_number: u64,
        summary: &mut PassSummary,
    ) -> ReconcileResult<()> {
        let tx_hash = row.transaction_hash.as_str();
        match self.store.resolve(tx_hash, deployer, contract).await {
            Ok(ResolveOutcome::Resolved) => {
                summary.resolved += 1;
                self.metrics.resolved_total.inc();
                info!(
                    "[Reconciler] Contract deployed at {} by {} (tx {}, block {}, template {})",
                    contract,
                    deployer,
                    tx_hash,
                    block_number,
                    row.template_kind()
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| row.template_id.to_string())
                );
            }
            Ok(ResolveOutcome::AlreadyResolved) => {
                summary.already_resolved += 1;
                debug!("[Reconciler] Issuance {} already resolved", tx_hash);
            }
            Ok(ResolveOutcome::NotFound) => {
                warn!(
                    "[Reconciler] Issuance {} disappeared before it could be resolved",
                    tx_hash
                );
            }
            Err(ReconcileError::ResolutionConflict(conflict)) => {
                summary.conflicts += 1;
                self.metrics.integrity_violations.inc();
                error!("[Reconciler] Refusing to overwrite issuance: {}", conflict);
            }
            Err(e) => return self.on_write_error(tx_hash, e, summary),
        }
        Ok(())
    }

    // An unreachable store is returned so the pass stops; any other write error only
    // costs this row.
    fn on_write_error(
        &self,
        tx_hash: &str,
        e: ReconcileError,
        summary: &mut PassSummary,
    ) -> ReconcileResult<()> {
        summary.store_errors += 1;
        self.record_store_error(&e);
        if e.is_store_outage() {
            return Err(e);
        }
        error!(
            "[Reconciler] Failed to persist outcome for {}, retrying next pass: {}",
            tx_hash, e
        );
        Ok(())
    }

    fn record_store_error(&self, e: &ReconcileError) {
        self.metrics
            .store_errors
            .with_label_values(&[e.error_type()])
            .inc();
    }

    async fn refresh_status_gauges(&self) {
        match self.store.count_by_status().await {
            Ok(counts) => {
                for status in IssuanceStatus::iter() {
                    self.metrics
                        .rows_by_status
                        .with_label_values(&[status.as_ref()])
                        .set(counts.get(status) as i64);
                }
            }
            Err(e) => {
                self.record_store_error(&e);
                warn!("[Reconciler] Failed to refresh status counts: {}", e);
            }
        }
    }
}

fn unix_now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.max_no_contract_observations, 3);
        assert_eq!(config.max_concurrent_lookups, 4);
        assert_eq!(config.pass_error_budget, 10);
    }

    #[test]
    fn test_summary_serializes_all_counters() {
        let json = serde_json::to_value(PassSummary::default()).unwrap();
        for key in [
            "candidates",
            "resolved",
            "already_resolved",
            "pending",
            "no_contract",
            "failed",
            "transient_errors",
            "store_errors",
            "skipped",
            "conflicts",
        ] {
            assert_eq!(json[key], 0, "missing {}", key);
        }
    }
}
