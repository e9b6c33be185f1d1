// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! A scripted ledger client used in tests and dry runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{parse_tx_hash, LedgerClient, ReceiptOutcome};
use crate::error::ReconcileResult;

// Responses for one transaction hash. Scripted responses are consumed in order; once the
// queue is drained, the sticky response (if any) is returned forever.
#[derive(Debug, Default)]
struct Script {
    queued: VecDeque<ReconcileResult<ReceiptOutcome>>,
    sticky: Option<ReconcileResult<ReceiptOutcome>>,
}

#[derive(Clone, Debug, Default)]
pub struct MockLedgerClient {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    calls: Arc<Mutex<HashMap<String, usize>>>,
    latest_block: Arc<AtomicU64>,
}

impl MockLedgerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot response for `tx_hash`.
    pub fn push_response(&self, tx_hash: &str, response: ReconcileResult<ReceiptOutcome>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(tx_hash.to_string())
            .or_default()
            .queued
            .push_back(response);
    }

    /// Response returned for `tx_hash` once its queue is empty.
    pub fn set_sticky_response(&self, tx_hash: &str, response: ReconcileResult<ReceiptOutcome>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(tx_hash.to_string())
            .or_default()
            .sticky = Some(response);
    }

    /// Answer `Pending` for the next `passes` lookups, then `outcome` from then on.
    pub fn pending_then(&self, tx_hash: &str, passes: usize, outcome: ReceiptOutcome) {
        for _ in 0..passes {
            self.push_response(tx_hash, Ok(ReceiptOutcome::Pending));
        }
        self.set_sticky_response(tx_hash, Ok(outcome));
    }

    pub fn set_latest_block(&self, value: u64) {
        self.latest_block.store(value, Ordering::Relaxed);
    }

    /// Number of `fetch_receipt` calls made for `tx_hash` that passed hash validation.
    pub fn calls_for(&self, tx_hash: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(tx_hash)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl LedgerClient for MockLedgerClient {
    async fn fetch_receipt(&self, tx_hash: &str) -> ReconcileResult<ReceiptOutcome> {
        parse_tx_hash(tx_hash)?;
        *self
            .calls
            .lock()
            .unwrap()
            .entry(tx_hash.to_string())
            .or_default() += 1;

        let mut scripts = self.scripts.lock().unwrap();
        let Some(script) = scripts.get_mut(tx_hash) else {
            return Ok(ReceiptOutcome::Pending);
        };
        match script.queued.pop_front() {
            Some(response) => response,
            None => script
                .sticky
                .clone()
                .unwrap_or(Ok(ReceiptOutcome::Pending)),
        }
    }

    async fn latest_block(&self) -> ReconcileResult<u64> {
        Ok(self.latest_block.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReconcileError;

    #[tokio::test]
    async fn test_scripted_responses() {
        let hash = format!("0x{}", "aa".repeat(32));
        let confirmed = ReceiptOutcome::ConfirmedContract {
            deployer: "0xdef".to_string(),
            contract: "0x123".to_string(),
            block_number: 1,
        };
        let client = MockLedgerClient::new();
        client.push_response(
            &hash,
            Err(ReconcileError::TransientProviderError("boom".to_string())),
        );
        client.pending_then(&hash, 1, confirmed.clone());

        assert!(client.fetch_receipt(&hash).await.is_err());
        assert_eq!(
            client.fetch_receipt(&hash).await.unwrap(),
            ReceiptOutcome::Pending
        );
        assert_eq!(client.fetch_receipt(&hash).await.unwrap(), confirmed);
        assert_eq!(client.fetch_receipt(&hash).await.unwrap(), confirmed);
        assert_eq!(client.calls_for(&hash), 4);
    }

    #[tokio::test]
    async fn test_unknown_hash_is_pending() {
        let client = MockLedgerClient::new();
        client.set_latest_block(42);
        let hash = format!("0x{}", "bb".repeat(32));
        assert_eq!(
            client.fetch_receipt(&hash).await.unwrap(),
            ReceiptOutcome::Pending
        );
        assert_eq!(client.latest_block().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_invalid_hash_is_rejected_without_counting() {
        let client = MockLedgerClient::new();
        assert!(matches!(
            client.fetch_receipt("0xdead").await,
            Err(ReconcileError::InvalidTxHash(_))
        ));
        assert_eq!(client.calls_for("0xdead"), 0);
    }
}
