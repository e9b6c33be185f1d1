// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use issuance_schema::models::{IssuanceStatus, NewPendingIssuance, PendingIssuance, TemplateKind};

use super::{classify_unmatched_resolve, IssuanceStore, NoContractOutcome, ResolveOutcome, StatusCounts};
use crate::error::{ReconcileError, ReconcileResult};

#[derive(Debug)]
struct State {
    rows: BTreeMap<i32, PendingIssuance>,
    next_id: i32,
    unavailable: bool,
    writes_unavailable: bool,
}

impl State {
    fn find_mut(&mut self, tx_hash: &str) -> Option<&mut PendingIssuance> {
        self.rows
            .values_mut()
            .find(|row| row.transaction_hash == tx_hash)
    }
}

/// Process-local store with the same semantics as the Postgres backend. Used by tests
/// and to exercise the loop without a database.
#[derive(Clone, Debug)]
pub struct InMemoryIssuanceStore {
    state: Arc<Mutex<State>>,
}

impl Default for InMemoryIssuanceStore {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                rows: BTreeMap::new(),
                next_id: 1,
                unavailable: false,
                writes_unavailable: false,
            })),
        }
    }
}

impl InMemoryIssuanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a database outage: every call fails with `StoreUnavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    /// Reads keep working while every write fails with `StoreUnavailable`, as when the
    /// database drops connections after a pass has selected its candidates.
    pub fn set_writes_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().writes_unavailable = unavailable;
    }

    fn lock(&self) -> ReconcileResult<std::sync::MutexGuard<'_, State>> {
        let state = self.state.lock().unwrap();
        if state.unavailable {
            return Err(ReconcileError::StoreUnavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(state)
    }

    fn lock_for_write(&self) -> ReconcileResult<std::sync::MutexGuard<'_, State>> {
        let state = self.lock()?;
        if state.writes_unavailable {
            return Err(ReconcileError::StoreUnavailable(
                "in-memory store rejecting writes".to_string(),
            ));
        }
        Ok(state)
    }
}

#[async_trait]
impl IssuanceStore for InMemoryIssuanceStore {
    async fn insert_pending(&self, new: NewPendingIssuance) -> ReconcileResult<PendingIssuance> {
        let mut state = self.lock_for_write()?;
        if state.find_mut(&new.transaction_hash).is_some() {
            return Err(ReconcileError::DuplicateTxHash(new.transaction_hash));
        }
        let id = state.next_id;
        state.next_id += 1;
        let row = PendingIssuance {
            id,
            template_id: new.template_id,
            transaction_hash: new.transaction_hash,
            deployer_address: None,
            contract_address: None,
            contract_abi: new.contract_abi,
            contract_bytecode: new.contract_bytecode,
            created_at: chrono::Utc::now().naive_utc(),
            status: IssuanceStatus::Pending.to_string(),
            no_contract_observations: 0,
            failure_reason: None,
        };
        state.rows.insert(id, row.clone());
        Ok(row)
    }

    async fn select_unresolved(&self) -> ReconcileResult<Vec<PendingIssuance>> {
        let state = self.lock()?;
        Ok(state
            .rows
            .values()
            .filter(|row| {
                row.contract_address.is_none() && row.status == IssuanceStatus::Pending.as_ref()
            })
            .cloned()
            .collect())
    }

    async fn resolve(
        &self,
        tx_hash: &str,
        deployer: &str,
        contract: &str,
    ) -> ReconcileResult<ResolveOutcome> {
        let mut state = self.lock_for_write()?;
        let existing = match state.find_mut(tx_hash) {
            Some(row)
                if row.contract_address.is_none()
                    && row.status == IssuanceStatus::Pending.as_ref() =>
            {
                row.deployer_address = Some(deployer.to_string());
                row.contract_address = Some(contract.to_string());
                row.status = IssuanceStatus::Resolved.to_string();
                return Ok(ResolveOutcome::Resolved);
            }
            Some(row) => Some(row.clone()),
            None => None,
        };
        classify_unmatched_resolve(existing, tx_hash, deployer, contract)
    }

    async fn record_no_contract(
        &self,
        tx_hash: &str,
        reason: &str,
        max_observations: u32,
    ) -> ReconcileResult<NoContractOutcome> {
        let mut state = self.lock_for_write()?;
        let Some(row) = state
            .find_mut(tx_hash)
            .filter(|row| row.status == IssuanceStatus::Pending.as_ref())
        else {
            return Ok(NoContractOutcome::NotFound);
        };
        row.no_contract_observations += 1;
        let observations = row.no_contract_observations as u32;
        if observations >= max_observations {
            row.status = IssuanceStatus::Failed.to_string();
            row.failure_reason = Some(reason.to_string());
            Ok(NoContractOutcome::Failed { observations })
        } else {
            Ok(NoContractOutcome::StillPending { observations })
        }
    }

    async fn mark_failed(&self, tx_hash: &str, reason: &str) -> ReconcileResult<bool> {
        let mut state = self.lock_for_write()?;
        match state.find_mut(tx_hash) {
            Some(row)
                if row.contract_address.is_none()
                    && row.status == IssuanceStatus::Pending.as_ref() =>
            {
                row.status = IssuanceStatus::Failed.to_string();
                row.failure_reason = Some(reason.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_by_tx_hash(&self, tx_hash: &str) -> ReconcileResult<Option<PendingIssuance>> {
        let mut state = self.lock()?;
        Ok(state.find_mut(tx_hash).map(|row| row.clone()))
    }

    async fn list_issued(
        &self,
        template: Option<TemplateKind>,
    ) -> ReconcileResult<Vec<PendingIssuance>> {
        let state = self.lock()?;
        Ok(state
            .rows
            .values()
            .filter(|row| row.contract_address.is_some())
            .filter(|row| template.map_or(true, |t| row.template_id == t.template_id()))
            .cloned()
            .collect())
    }

    async fn count_by_status(&self) -> ReconcileResult<StatusCounts> {
        let state = self.lock()?;
        let mut counts = StatusCounts::default();
        for row in state.rows.values() {
            match row.status() {
                IssuanceStatus::Pending => counts.pending += 1,
                IssuanceStatus::Resolved => counts.resolved += 1,
                IssuanceStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn purge(&self) -> ReconcileResult<()> {
        let mut state = self.lock_for_write()?;
        state.rows.clear();
        state.next_id = 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> String {
        format!("0x{}", format!("{:02x}", byte).repeat(32))
    }

    fn new_row(byte: u8, template: TemplateKind) -> NewPendingIssuance {
        NewPendingIssuance::new(template, hash(byte), "[]", "0x6080")
    }

    fn assert_pairing(row: &PendingIssuance) {
        assert_eq!(
            row.deployer_address.is_none(),
            row.contract_address.is_none(),
            "pairing violated for {:?}",
            row
        );
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids() {
        let store = InMemoryIssuanceStore::new();
        let a = store.insert_pending(new_row(1, TemplateKind::Bond)).await.unwrap();
        let b = store.insert_pending(new_row(2, TemplateKind::Share)).await.unwrap();
        assert!(b.id > a.id);
        assert_eq!(a.status(), IssuanceStatus::Pending);
        assert_pairing(&a);
    }

    #[tokio::test]
    async fn test_duplicate_tx_hash_rejected() {
        let store = InMemoryIssuanceStore::new();
        store.insert_pending(new_row(1, TemplateKind::Bond)).await.unwrap();
        let err = store
            .insert_pending(new_row(1, TemplateKind::Coupon))
            .await
            .unwrap_err();
        assert_eq!(err, ReconcileError::DuplicateTxHash(hash(1)));
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let store = InMemoryIssuanceStore::new();
        store.insert_pending(new_row(1, TemplateKind::Bond)).await.unwrap();

        let first = store.resolve(&hash(1), "0xdef", "0x123").await.unwrap();
        assert_eq!(first, ResolveOutcome::Resolved);
        let before = store.find_by_tx_hash(&hash(1)).await.unwrap().unwrap();

        let second = store.resolve(&hash(1), "0xdef", "0x123").await.unwrap();
        assert_eq!(second, ResolveOutcome::AlreadyResolved);
        let after = store.find_by_tx_hash(&hash(1)).await.unwrap().unwrap();
        assert_eq!(before, after);
        assert_pairing(&after);
    }

    #[tokio::test]
    async fn test_conflicting_resolve_rejected() {
        let store = InMemoryIssuanceStore::new();
        store.insert_pending(new_row(1, TemplateKind::Bond)).await.unwrap();
        store.resolve(&hash(1), "0xdef", "0x123").await.unwrap();

        let err = store.resolve(&hash(1), "0xdef", "0x999").await.unwrap_err();
        assert_eq!(err.error_type(), "resolution_conflict");

        let row = store.find_by_tx_hash(&hash(1)).await.unwrap().unwrap();
        assert_eq!(row.contract_address.as_deref(), Some("0x123"));
    }

    #[tokio::test]
    async fn test_resolve_unknown_hash() {
        let store = InMemoryIssuanceStore::new();
        assert_eq!(
            store.resolve(&hash(9), "0xdef", "0x123").await.unwrap(),
            ResolveOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_resolved_row_leaves_candidate_set() {
        let store = InMemoryIssuanceStore::new();
        store.insert_pending(new_row(1, TemplateKind::Bond)).await.unwrap();
        store.insert_pending(new_row(2, TemplateKind::Bond)).await.unwrap();
        store.resolve(&hash(1), "0xdef", "0x123").await.unwrap();

        let unresolved = store.select_unresolved().await.unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].transaction_hash, hash(2));
    }

    #[tokio::test]
    async fn test_no_contract_observations_cap() {
        let store = InMemoryIssuanceStore::new();
        store.insert_pending(new_row(1, TemplateKind::Bond)).await.unwrap();

        assert_eq!(
            store.record_no_contract(&hash(1), "reverted", 2).await.unwrap(),
            NoContractOutcome::StillPending { observations: 1 }
        );
        assert_eq!(
            store.record_no_contract(&hash(1), "reverted", 2).await.unwrap(),
            NoContractOutcome::Failed { observations: 2 }
        );
        assert_eq!(
            store.record_no_contract(&hash(1), "reverted", 2).await.unwrap(),
            NoContractOutcome::NotFound
        );

        let row = store.find_by_tx_hash(&hash(1)).await.unwrap().unwrap();
        assert_eq!(row.status(), IssuanceStatus::Failed);
        assert_eq!(row.failure_reason.as_deref(), Some("reverted"));
        assert_pairing(&row);
        assert!(store.select_unresolved().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_row_cannot_be_resolved() {
        let store = InMemoryIssuanceStore::new();
        store.insert_pending(new_row(1, TemplateKind::Bond)).await.unwrap();
        assert!(store.mark_failed(&hash(1), "invalid_tx_hash").await.unwrap());
        assert!(!store.mark_failed(&hash(1), "invalid_tx_hash").await.unwrap());

        let err = store.resolve(&hash(1), "0xdef", "0x123").await.unwrap_err();
        assert_eq!(err.error_type(), "resolution_conflict");
    }

    #[tokio::test]
    async fn test_list_issued_filters_by_template() {
        let store = InMemoryIssuanceStore::new();
        store.insert_pending(new_row(1, TemplateKind::Bond)).await.unwrap();
        store.insert_pending(new_row(2, TemplateKind::Share)).await.unwrap();
        store.insert_pending(new_row(3, TemplateKind::Bond)).await.unwrap();
        store.resolve(&hash(1), "0xdef", "0x1").await.unwrap();
        store.resolve(&hash(2), "0xdef", "0x2").await.unwrap();

        assert_eq!(store.list_issued(None).await.unwrap().len(), 2);
        let bonds = store.list_issued(Some(TemplateKind::Bond)).await.unwrap();
        assert_eq!(bonds.len(), 1);
        assert_eq!(bonds[0].contract_address.as_deref(), Some("0x1"));

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(
            counts,
            StatusCounts {
                pending: 1,
                resolved: 2,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn test_purge_resets_ids() {
        let store = InMemoryIssuanceStore::new();
        store.insert_pending(new_row(1, TemplateKind::Bond)).await.unwrap();
        store.insert_pending(new_row(2, TemplateKind::Bond)).await.unwrap();
        store.purge().await.unwrap();

        assert!(store.select_unresolved().await.unwrap().is_empty());
        let row = store.insert_pending(new_row(3, TemplateKind::Bond)).await.unwrap();
        assert_eq!(row.id, 1);
    }

    #[tokio::test]
    async fn test_writes_unavailable_keeps_reads() {
        let store = InMemoryIssuanceStore::new();
        store.insert_pending(new_row(1, TemplateKind::Bond)).await.unwrap();
        store.set_writes_unavailable(true);

        assert_eq!(store.select_unresolved().await.unwrap().len(), 1);
        let err = store.resolve(&hash(1), "0xdef", "0x123").await.unwrap_err();
        assert!(err.is_store_outage());
        assert!(store
            .record_no_contract(&hash(1), "reverted", 3)
            .await
            .unwrap_err()
            .is_store_outage());

        store.set_writes_unavailable(false);
        assert_eq!(
            store.resolve(&hash(1), "0xdef", "0x123").await.unwrap(),
            ResolveOutcome::Resolved
        );
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = InMemoryIssuanceStore::new();
        store.set_unavailable(true);
        assert!(store.select_unresolved().await.unwrap_err().is_store_error());
        store.set_unavailable(false);
        assert!(store.select_unresolved().await.is_ok());
    }
}
