//! Merchant agent HTTP server.
//!
//! # Usage
//!
//! ```bash
//! # Run with default config (merchant.toml in current directory)
//! cargo run -p mupay-merchant --release
//!
//! # Run with custom config path
//! CONFIG=/path/to/merchant.toml cargo run -p mupay-merchant
//!
//! # Configure logging level
//! RUST_LOG=debug cargo run -p mupay-merchant
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` — Path to TOML configuration file (default: `merchant.toml`)
//! - `HOST` — Override bind address (default: `0.0.0.0`)
//! - `PORT` — Override port (default: `3001`)
//! - `RUST_LOG` — Log level filter (default: `info`)
//!
//! A `.env` file in the working directory is loaded first.

use std::net::SocketAddr;
use std::sync::Arc;

use alloy_signer_local::PrivateKeySigner;
use axum::http::Method;
use mupay::{ChannelLedger, Merchant};
use mupay_evm::{ChannelWatcher, EvmChannelContract, connect};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tower_http::cors;
use tracing_subscriber::EnvFilter;

use mupay_merchant::config::MerchantConfig;
use mupay_merchant::handlers::{AppState, merchant_router};
use mupay_merchant::resource::Resource;
use mupay_merchant::util::SigDown;

/// Capacity of the channel-opened notification queue.
const NOTIFICATION_BUFFER: usize = 64;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // Initialize tracing with RUST_LOG env filter
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!("Merchant failed: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = MerchantConfig::load()?;
    config.validate()?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        step_policy = ?config.ledger.step_policy,
        "Loaded configuration"
    );

    let signer: PrivateKeySigner = config
        .signer_private_key()?
        .parse()
        .map_err(|e| format!("Invalid merchant signer key: {e}"))?;
    let merchant_address = signer.address();
    let contract_address = config.contract_address()?;

    let provider = connect(config.rpc_url()?, signer);
    let contract = EvmChannelContract::new(provider.clone(), contract_address)
        .with_confirmations(config.chain.confirmations)
        .with_receipt_timeout(config.receipt_timeout());
    let ledger = Arc::new(ChannelLedger::with_policy(config.ledger.step_policy));
    let state = Arc::new(AppState {
        merchant: Merchant::new(merchant_address, contract, ledger),
        resource: Resource::from_config(&config.resource)?,
    });
    tracing::info!(
        merchant = %merchant_address,
        contract = %contract_address,
        "Merchant agent initialized"
    );

    let sig_down = SigDown::try_new()?;
    let cancel = sig_down.cancellation_token();
    let tasks = TaskTracker::new();

    // Escrow log watcher feeding the dispatch loop
    let (sender, receiver) = mpsc::channel(NOTIFICATION_BUFFER);
    let mut watcher = ChannelWatcher::new(provider, contract_address, merchant_address)
        .with_poll_interval(config.poll_interval());
    if let Some(block) = config.watcher.start_block {
        watcher = watcher.starting_at(block);
    }
    tasks.spawn(watcher.run(sender, cancel.clone()));
    {
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        tasks.spawn(async move { state.merchant.run_dispatch(receiver, cancel).await });
    }
    tasks.close();

    // Build Axum router
    let app = merchant_router(Arc::clone(&state)).layer(
        cors::CorsLayer::new()
            .allow_origin(cors::Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(cors::Any),
    );

    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Merchant listening on http://{addr}");

    let shutdown = cancel.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;

    // Stop background tasks even if the server failed on its own
    cancel.cancel();
    tasks.wait().await;
    sig_down.recv().await;
    served?;

    let open = state.merchant.ledger().snapshot().await;
    if !open.is_empty() {
        tracing::warn!(
            channels = open.len(),
            "Shutting down with unredeemed channels; they remain redeemable on-chain until expiry"
        );
    }
    tracing::info!("Merchant shut down gracefully");
    Ok(())
}
