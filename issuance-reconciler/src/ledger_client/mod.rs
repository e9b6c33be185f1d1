// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Read-only access to the ledger: receipt lookups and chain head queries.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use ethers::types::TxHash;
use strum_macros::{AsRefStr, Display};

use crate::error::{ReconcileError, ReconcileResult};

mod eth;
mod mock;

pub use eth::{EthLedgerClient, EthLedgerOptions};
pub use mock::MockLedgerClient;

/// Why a finalized transaction did not leave a contract behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum NoContractReason {
    // Receipt status 0
    Reverted,
    // Succeeded, but was not a contract creation
    NotContractCreation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptOutcome {
    /// No receipt yet, or not enough confirmations on top of it.
    Pending,
    ConfirmedContract {
        deployer: String,
        contract: String,
        block_number: u64,
    },
    ConfirmedNoContract {
        deployer: String,
        block_number: u64,
        reason: NoContractReason,
    },
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Look up the receipt of a deployment transaction and classify it.
    async fn fetch_receipt(&self, tx_hash: &str) -> ReconcileResult<ReceiptOutcome>;

    /// Current chain head.
    async fn latest_block(&self) -> ReconcileResult<u64>;
}

/// Startup backoff for reaching the ledger: 0.4s doubling up to 2 minutes between
/// attempts, with no overall deadline.
pub fn startup_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: Duration::from_millis(400),
        initial_interval: Duration::from_millis(400),
        randomization_factor: 0.1,
        multiplier: 2.0,
        max_interval: Duration::from_secs(120),
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// Retry `op` under `backoff` while it fails with a transient ledger error. Any other
/// error is returned on the spot.
pub async fn retry_transient<T, F, Fut>(backoff: ExponentialBackoff, mut op: F) -> ReconcileResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ReconcileResult<T>>,
{
    backoff::future::retry(backoff, || {
        let fut = op();
        async move {
            fut.await.map_err(|e| {
                if e.is_transient_ledger_error() {
                    tracing::warn!("[LedgerClient] Ledger not reachable, retrying: {}", e);
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
}

/// Parse a transaction hash in canonical form: `0x` followed by 64 hex chars.
pub fn parse_tx_hash(tx_hash: &str) -> ReconcileResult<TxHash> {
    let hex_part = tx_hash
        .strip_prefix("0x")
        .ok_or_else(|| ReconcileError::InvalidTxHash(tx_hash.to_string()))?;
    if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ReconcileError::InvalidTxHash(tx_hash.to_string()));
    }
    hex_part
        .parse::<TxHash>()
        .map_err(|_| ReconcileError::InvalidTxHash(tx_hash.to_string()))
}
