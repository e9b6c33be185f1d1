// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use ethers::providers::{JsonRpcClient, Middleware, Provider, ProviderError};
use ethers::types::U64;
use ethers::utils::to_checksum;
use tap::TapFallible;

use super::{parse_tx_hash, retry_transient, LedgerClient, NoContractReason, ReceiptOutcome};
use crate::error::{ReconcileError, ReconcileResult};
use crate::metered_eth_provider::{new_metered_eth_provider, MeteredEthHttpProvider};
use crate::metrics::ReconcilerMetrics;

#[derive(Debug, Clone)]
pub struct EthLedgerOptions {
    /// Upper bound for a single JSON-RPC round trip.
    pub request_timeout: Duration,
    /// Blocks (including the receipt's own) required before a receipt counts as final.
    pub min_confirmations: u64,
    /// Refuse to start against any other chain when set.
    pub expected_chain_id: Option<u64>,
}

impl Default for EthLedgerOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            min_confirmations: 1,
            expected_chain_id: None,
        }
    }
}

pub struct EthLedgerClient<P> {
    provider: Provider<P>,
    options: EthLedgerOptions,
}

impl EthLedgerClient<MeteredEthHttpProvider> {
    pub async fn new(
        provider_url: &str,
        options: EthLedgerOptions,
        metrics: Arc<ReconcilerMetrics>,
    ) -> ReconcileResult<Self> {
        let client = Self::build(provider_url, options, metrics)?;
        client.describe().await?;
        Ok(client)
    }

    /// Like [`Self::new`], but keeps retrying while the endpoint is unreachable.
    pub async fn connect_with_retry(
        provider_url: &str,
        options: EthLedgerOptions,
        metrics: Arc<ReconcilerMetrics>,
        backoff: ExponentialBackoff,
    ) -> ReconcileResult<Self> {
        let client = Self::build(provider_url, options, metrics)?;
        client.describe_with_retry(backoff).await?;
        Ok(client)
    }

    // A malformed URL is not worth retrying, so it fails here before any request.
    fn build(
        provider_url: &str,
        options: EthLedgerOptions,
        metrics: Arc<ReconcilerMetrics>,
    ) -> ReconcileResult<Self> {
        let provider = new_metered_eth_provider(provider_url, options.request_timeout, metrics)
            .map_err(|e| ReconcileError::ProviderError(format!("{:#}", e)))?;
        Ok(Self { provider, options })
    }
}

#[cfg(test)]
impl EthLedgerClient<ethers::providers::MockProvider> {
    pub fn new_mocked(provider: ethers::providers::MockProvider, options: EthLedgerOptions) -> Self {
        Self {
            provider: Provider::new(provider),
            options,
        }
    }
}

impl<P> EthLedgerClient<P>
where
    P: JsonRpcClient + 'static,
{
    pub async fn chain_id(&self) -> ReconcileResult<u64> {
        let chain_id = self.with_timeout(self.provider.get_chainid()).await?;
        Ok(chain_id.as_u64())
    }

    // Validate chain identifier and log connection info
    async fn describe(&self) -> ReconcileResult<()> {
        let chain_id = self.chain_id().await?;
        let block_number = self.latest_block().await?;

        match self.options.expected_chain_id {
            Some(expected) if expected != chain_id => {
                return Err(ReconcileError::ChainIdMismatch {
                    expected,
                    actual: chain_id,
                });
            }
            Some(_) => tracing::info!(
                "[EthLedgerClient] Connected to chain {} (verified), current block: {}",
                chain_id,
                block_number
            ),
            None => tracing::warn!(
                "[EthLedgerClient] Connected to chain {} (NOT VERIFIED - no expected chain ID set), current block: {}",
                chain_id,
                block_number
            ),
        }
        Ok(())
    }

    /// Chain id check with transient failures retried under `backoff`. A mismatch is
    /// returned on the first answer.
    pub async fn describe_with_retry(&self, backoff: ExponentialBackoff) -> ReconcileResult<()> {
        retry_transient(backoff, || self.describe()).await
    }

    async fn with_timeout<T, F>(&self, fut: F) -> ReconcileResult<T>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match tokio::time::timeout(self.options.request_timeout, fut).await {
            Ok(result) => result.map_err(ReconcileError::from),
            Err(_) => Err(ReconcileError::ProviderTimeout(self.options.request_timeout)),
        }
    }

    async fn is_final(&self, receipt_block: u64) -> ReconcileResult<bool> {
        if self.options.min_confirmations <= 1 {
            return Ok(true);
        }
        let head = self.latest_block().await?;
        let confirmations = if head >= receipt_block {
            head - receipt_block + 1
        } else {
            0
        };
        Ok(confirmations >= self.options.min_confirmations)
    }
}

#[async_trait]
impl<P> LedgerClient for EthLedgerClient<P>
where
    P: JsonRpcClient + 'static,
{
    async fn fetch_receipt(&self, tx_hash: &str) -> ReconcileResult<ReceiptOutcome> {
        let hash = parse_tx_hash(tx_hash)?;
        let receipt = self
            .with_timeout(self.provider.get_transaction_receipt(hash))
            .await
            .tap_err(|e| {
                tracing::warn!(
                    "[EthLedgerClient] RPC error getting receipt: tx_hash={}, error={}",
                    tx_hash,
                    e
                )
            })?;

        let Some(receipt) = receipt else {
            tracing::debug!("[EthLedgerClient] Receipt not found yet: tx_hash={}", tx_hash);
            return Ok(ReceiptOutcome::Pending);
        };
        // Some providers return receipts for transactions in the pending block
        let Some(block_number) = receipt.block_number.map(|b| b.as_u64()) else {
            return Ok(ReceiptOutcome::Pending);
        };
        if !self.is_final(block_number).await? {
            tracing::debug!(
                "[EthLedgerClient] Receipt at block {} lacks {} confirmations: tx_hash={}",
                block_number,
                self.options.min_confirmations,
                tx_hash
            );
            return Ok(ReceiptOutcome::Pending);
        }

        let deployer = to_checksum(&receipt.from, None);
        // A failed creation can still carry the address it would have deployed to
        if receipt.status == Some(U64::zero()) {
            return Ok(ReceiptOutcome::ConfirmedNoContract {
                deployer,
                block_number,
                reason: NoContractReason::Reverted,
            });
        }
        Ok(match receipt.contract_address {
            Some(contract) => ReceiptOutcome::ConfirmedContract {
                deployer,
                contract: to_checksum(&contract, None),
                block_number,
            },
            None => ReceiptOutcome::ConfirmedNoContract {
                deployer,
                block_number,
                reason: NoContractReason::NotContractCreation,
            },
        })
    }

    async fn latest_block(&self) -> ReconcileResult<u64> {
        let block = self.with_timeout(self.provider.get_block_number()).await?;
        Ok(block.as_u64())
    }
}
