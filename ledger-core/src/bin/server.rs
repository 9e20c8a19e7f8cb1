//! Voucher ledger server binary
//!
//! Usage: `voucher-ledger-server [config.toml]`. Without a path the
//! configuration comes from `VOUCHER_LEDGER_*` environment variables.

use anyhow::Context;
use std::sync::Arc;
use voucher_ledger::{http, Config, LedgerEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting voucher ledger server");

    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => Config::from_env().context("Failed to load config from environment")?,
    };

    // Open ledger
    let metrics_addr = config.metrics_listen_addr.clone();
    let engine = Arc::new(
        LedgerEngine::open(config)
            .await
            .context("Failed to open ledger")?,
    );

    if engine.is_halted() {
        tracing::error!("Audit chain verification failed; serving reads only until remediation");
    }

    let stats = engine.store_stats()?;
    tracing::info!(
        wallets = stats.total_wallets,
        vouchers = stats.total_vouchers,
        transactions = stats.total_transactions,
        pending_notifications = stats.pending_notifications,
        "Ledger ready"
    );

    // Metrics and health endpoints
    let listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("Failed to bind metrics endpoint {}", metrics_addr))?;
    let endpoints = tokio::spawn(http::serve(engine.clone(), listener));

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down voucher ledger server");
    endpoints.abort();
    engine.shutdown().await?;
    Ok(())
}
