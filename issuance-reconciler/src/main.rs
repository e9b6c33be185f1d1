// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use issuance_pg_db::{Db, DbArgs};
use issuance_reconciler::config::{Args, Command, ReconcileArgs};
use issuance_reconciler::ledger_client::{startup_backoff, EthLedgerClient};
use issuance_reconciler::metered_eth_provider::MeteredEthHttpProvider;
use issuance_reconciler::metrics::ReconcilerMetrics;
use issuance_reconciler::metrics_server::start_metrics_server;
use issuance_reconciler::reconciler::Reconciler;
use issuance_reconciler::store::{IssuanceStore, PgIssuanceStore};
use issuance_schema::models::IssuanceStatus;
use issuance_schema::MIGRATIONS;
use prometheus::Registry;
use strum::IntoEnumIterator;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use url::Url;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let db = init_database(&args.database_url, &args.db_args).await?;
    let store = Arc::new(PgIssuanceStore::new(db, args.reconcile.store_timeout()));

    match args.command.clone().unwrap_or(Command::Run) {
        Command::Run => run(&args, store).await,
        Command::RunOnce => run_once(&args.reconcile, store).await,
        Command::Status => print_status(store.as_ref()).await,
        Command::Purge { yes } => purge(store.as_ref(), yes).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn init_database(database_url: &Url, db_args: &DbArgs) -> anyhow::Result<Db> {
    let db = Db::for_write(database_url.clone(), db_args.clone())
        .await
        .context("Failed to create database pool")?;
    db.run_migrations(&MIGRATIONS)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("[Main] Database migrations completed");
    Ok(db)
}

fn eth_rpc_url(reconcile: &ReconcileArgs) -> anyhow::Result<&str> {
    reconcile
        .eth_rpc_url
        .as_deref()
        .context("--eth-rpc-url (ETH_RPC_URL) is required")
}

// The long-running loop waits for the ledger to come up; only a chain id mismatch
// or a malformed URL ends startup.
async fn connect_ledger(
    reconcile: &ReconcileArgs,
    metrics: Arc<ReconcilerMetrics>,
) -> anyhow::Result<EthLedgerClient<MeteredEthHttpProvider>> {
    let client = EthLedgerClient::connect_with_retry(
        eth_rpc_url(reconcile)?,
        reconcile.ledger_options(),
        metrics,
        startup_backoff(),
    )
    .await
    .context("Failed to initialize ledger client")?;
    Ok(client)
}

async fn run(args: &Args, store: Arc<PgIssuanceStore>) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let registry = Registry::new();
    let metrics = Arc::new(ReconcilerMetrics::new(&registry));
    let (_, metrics_handle) =
        start_metrics_server(args.metrics_address, registry, cancel.child_token()).await?;

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("[Main] Shutdown requested, waiting for the current pass to finish");
        signal_cancel.cancel();
    });

    let ledger = tokio::select! {
        ledger = connect_ledger(&args.reconcile, metrics.clone()) => Arc::new(ledger?),
        _ = cancel.cancelled() => {
            tracing::info!("[Main] Shutdown before the ledger was reachable");
            let _ = metrics_handle.await;
            return Ok(());
        }
    };
    let reconciler = Reconciler::new(ledger, store, args.reconcile.reconciler_config(), metrics);
    let reconciler_handle = tokio::spawn(reconciler.run(cancel.clone()));

    reconciler_handle
        .await
        .context("Reconciler task panicked")?;
    let _ = metrics_handle.await;
    tracing::info!("[Main] Stopped");
    Ok(())
}

async fn run_once(reconcile: &ReconcileArgs, store: Arc<PgIssuanceStore>) -> anyhow::Result<()> {
    let metrics = Arc::new(ReconcilerMetrics::new(&Registry::new()));
    let ledger = EthLedgerClient::new(eth_rpc_url(reconcile)?, reconcile.ledger_options(), metrics.clone())
        .await
        .context("Failed to initialize ledger client")?;
    let ledger = Arc::new(ledger);
    let reconciler = Reconciler::new(ledger, store, reconcile.reconciler_config(), metrics);
    let summary = reconciler.run_pass().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn print_status(store: &PgIssuanceStore) -> anyhow::Result<()> {
    let counts = store.count_by_status().await?;
    for status in IssuanceStatus::iter() {
        println!("{:<10} {}", status.as_ref(), counts.get(status));
    }
    Ok(())
}

async fn purge(store: &PgIssuanceStore, yes: bool) -> anyhow::Result<()> {
    if !yes {
        anyhow::bail!("Refusing to purge without --yes");
    }
    store.purge().await?;
    tracing::warn!("[Main] Purged all issuance rows");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("[Main] Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("[Main] Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
