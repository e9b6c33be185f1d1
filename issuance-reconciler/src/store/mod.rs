// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Persistence of pending issuances.
//!
//! The producer inserts rows, the reconciler reads the unresolved set and writes
//! outcomes back, downstream consumers read resolved rows. Both backends share the
//! same rules:
//!
//! - `admin_address` and `token_address` are written together by one statement
//! - a resolved or failed row is never rewritten with different values
//! - only `pending` rows without a contract address are reconciliation candidates

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use issuance_schema::models::{IssuanceStatus, NewPendingIssuance, PendingIssuance, TemplateKind};

use crate::error::{ReconcileError, ReconcileResult, ResolutionConflict};

mod memory;
mod pg;

pub use memory::InMemoryIssuanceStore;
pub use pg::PgIssuanceStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved,
    // Same values were already persisted
    AlreadyResolved,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoContractOutcome {
    StillPending { observations: u32 },
    Failed { observations: u32 },
    NotFound,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    pub resolved: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn get(&self, status: IssuanceStatus) -> u64 {
        match status {
            IssuanceStatus::Pending => self.pending,
            IssuanceStatus::Resolved => self.resolved,
            IssuanceStatus::Failed => self.failed,
        }
    }
}

#[async_trait]
pub trait IssuanceStore: Send + Sync {
    /// Record a freshly broadcast deployment. Fails with `DuplicateTxHash` if the hash exists.
    async fn insert_pending(&self, new: NewPendingIssuance) -> ReconcileResult<PendingIssuance>;

    /// Snapshot of all reconciliation candidates, ordered by id.
    async fn select_unresolved(&self) -> ReconcileResult<Vec<PendingIssuance>>;

    /// Persist deployer and contract address of a confirmed deployment.
    async fn resolve(
        &self,
        tx_hash: &str,
        deployer: &str,
        contract: &str,
    ) -> ReconcileResult<ResolveOutcome>;

    /// Count a final receipt that created no contract. The row turns `failed` once
    /// `max_observations` is reached.
    async fn record_no_contract(
        &self,
        tx_hash: &str,
        reason: &str,
        max_observations: u32,
    ) -> ReconcileResult<NoContractOutcome>;

    /// Move a pending row to `failed`. Returns false if no pending row matched.
    async fn mark_failed(&self, tx_hash: &str, reason: &str) -> ReconcileResult<bool>;

    async fn find_by_tx_hash(&self, tx_hash: &str) -> ReconcileResult<Option<PendingIssuance>>;

    /// Resolved rows, optionally restricted to one template, ordered by id.
    async fn list_issued(
        &self,
        template: Option<TemplateKind>,
    ) -> ReconcileResult<Vec<PendingIssuance>>;

    async fn count_by_status(&self) -> ReconcileResult<StatusCounts>;

    /// Delete every row and restart the id sequence. Maintenance only.
    async fn purge(&self) -> ReconcileResult<()>;
}

/// Classify a resolve that matched no pending row, given the row as it is now.
pub(crate) fn classify_unmatched_resolve(
    existing: Option<PendingIssuance>,
    tx_hash: &str,
    deployer: &str,
    contract: &str,
) -> ReconcileResult<ResolveOutcome> {
    let Some(row) = existing else {
        return Ok(ResolveOutcome::NotFound);
    };
    if row.deployer_address.as_deref() == Some(deployer)
        && row.contract_address.as_deref() == Some(contract)
    {
        return Ok(ResolveOutcome::AlreadyResolved);
    }
    Err(ReconcileError::ResolutionConflict(Box::new(
        ResolutionConflict {
            tx_hash: tx_hash.to_string(),
            existing_status: row.status,
            existing_deployer: row.deployer_address,
            existing_contract: row.contract_address,
            attempted_deployer: deployer.to_string(),
            attempted_contract: contract.to_string(),
        },
    )))
}

/// Bound a store call by `timeout`.
pub(crate) async fn with_store_timeout<T, F>(timeout: Duration, fut: F) -> ReconcileResult<T>
where
    F: Future<Output = ReconcileResult<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or(Err(ReconcileError::StoreTimeout(timeout)))
}
