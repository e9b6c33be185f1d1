// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Token issuance reconciler
//!
//! Deploy transactions for new tokens are broadcast by a producer that records a
//! pending row in the `tokens` table. This crate polls the ledger for the receipts of
//! those transactions and fills in the deployer and contract address once the
//! deployment is final.
//!
//! ```text
//! Producer ──insert_pending──▶ tokens ◀──resolve── Reconciler ──receipts──▶ Ledger
//!                                 │
//!                                 └──list_issued──▶ Downstream consumers
//! ```

pub mod config;
pub mod error;
pub mod ledger_client;
pub mod metered_eth_provider;
pub mod metrics;
pub mod metrics_server;
pub mod reconciler;
pub mod store;
