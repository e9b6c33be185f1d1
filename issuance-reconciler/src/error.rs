// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use ethers::providers::ProviderError;

/// Details of a rejected attempt to overwrite a row that is no longer pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionConflict {
    pub tx_hash: String,
    pub existing_status: String,
    pub existing_deployer: Option<String>,
    pub existing_contract: Option<String>,
    pub attempted_deployer: String,
    pub attempted_contract: String,
}

impl std::fmt::Display for ResolutionConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tx {} is {} with deployer={:?} contract={:?}, refusing deployer={} contract={}",
            self.tx_hash,
            self.existing_status,
            self.existing_deployer,
            self.existing_contract,
            self.attempted_deployer,
            self.attempted_contract
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    // The input is not a canonical `0x` + 64 hex chars transaction hash
    #[error("Invalid transaction hash: {0}")]
    InvalidTxHash(String),
    // Transport or JSON-RPC level failure, retried on the next pass
    #[error("Transient provider error: {0}")]
    TransientProviderError(String),
    #[error("Provider request timed out after {0:?}")]
    ProviderTimeout(Duration),
    // Provider answered with something we cannot interpret
    #[error("Provider error: {0}")]
    ProviderError(String),
    #[error("Chain ID mismatch: expected {expected}, got {actual}")]
    ChainIdMismatch { expected: u64, actual: u64 },
    // Database could not be reached (pool exhausted, connection refused)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Store operation timed out after {0:?}")]
    StoreTimeout(Duration),
    // Query failed after reaching the database
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Transaction hash already recorded: {0}")]
    DuplicateTxHash(String),
    // Attempt to rewrite a resolved or failed row with different values
    #[error("Resolution conflict: {0}")]
    ResolutionConflict(Box<ResolutionConflict>),
}

impl ReconcileError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            ReconcileError::InvalidTxHash(_) => "invalid_tx_hash",
            ReconcileError::TransientProviderError(_) => "transient_provider_error",
            ReconcileError::ProviderTimeout(_) => "provider_timeout",
            ReconcileError::ProviderError(_) => "provider_error",
            ReconcileError::ChainIdMismatch { .. } => "chain_id_mismatch",
            ReconcileError::StoreUnavailable(_) => "store_unavailable",
            ReconcileError::StoreTimeout(_) => "store_timeout",
            ReconcileError::StorageError(_) => "storage_error",
            ReconcileError::DuplicateTxHash(_) => "duplicate_tx_hash",
            ReconcileError::ResolutionConflict(_) => "resolution_conflict",
        }
    }

    /// Ledger-side failures that leave the row untouched and are retried next pass.
    pub fn is_transient_ledger_error(&self) -> bool {
        matches!(
            self,
            ReconcileError::TransientProviderError(_)
                | ReconcileError::ProviderTimeout(_)
                | ReconcileError::ProviderError(_)
        )
    }

    /// The store cannot be reached at all, so further writes in this pass are pointless.
    pub fn is_store_outage(&self) -> bool {
        matches!(
            self,
            ReconcileError::StoreUnavailable(_) | ReconcileError::StoreTimeout(_)
        )
    }

    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            ReconcileError::StoreUnavailable(_)
                | ReconcileError::StoreTimeout(_)
                | ReconcileError::StorageError(_)
        )
    }
}

impl From<ProviderError> for ReconcileError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::SerdeJson(e) => ReconcileError::ProviderError(e.to_string()),
            ProviderError::HexError(e) => ReconcileError::ProviderError(e.to_string()),
            other => ReconcileError::TransientProviderError(other.to_string()),
        }
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
