//! Payer agent binary.
//!
//! # Usage
//!
//! ```bash
//! # Open a channel, buy data and have the merchant redeem
//! cargo run -p mupay-payer -- run
//!
//! # Recover an unredeemed escrow once the withdrawal window has opened
//! cargo run -p mupay-payer -- reclaim --merchant 0x...
//! ```
//!
//! Arguments fall back to environment variables (`RPC_URL`, `PRIVATE_KEY`,
//! `CONTRACT_ADDRESS`, `TOKEN_ADDRESS`, `MERCHANT_AGENT_URL`, ...), and a
//! `.env` file in the working directory is loaded first. `RUST_LOG` sets the
//! log filter (default: `info`).

use std::process::ExitCode;

use alloy_primitives::Address;
use clap::Parser;
use mupay::{AssetAllowance, ChannelContract, ChannelError};
use mupay_evm::{EvmChannelContract, connect};
use mupay_http::MerchantClient;
use tracing_subscriber::EnvFilter;

use mupay_payer::cli::{ChainArgs, Cli, Command, ReclaimArgs, RunArgs};
use mupay_payer::{Outcome, run_session};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize tracing with RUST_LOG env filter
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let result = match cli.command {
        Command::Run(args) => run(args).await,
        Command::Reclaim(args) => reclaim(args).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Payer failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Connects the payer's signer to the escrow contract.
fn escrow(
    chain: &ChainArgs,
) -> Result<(Address, impl ChannelContract + AssetAllowance), ChannelError> {
    let signer = chain.signer()?;
    let payer = signer.address();
    let contract = EvmChannelContract::new(connect(chain.rpc_url.clone(), signer), chain.contract)
        .with_confirmations(chain.confirmations)
        .with_receipt_timeout(chain.receipt_timeout());
    Ok((payer, contract))
}

async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let (payer, contract) = escrow(&args.chain)?;
    tracing::info!(
        payer = %payer,
        merchant_url = %args.merchant_url,
        token = %args.chain.token,
        amount = %args.amount,
        hashchain_length = args.hashchain_length,
        "Starting payer session"
    );
    let client = MerchantClient::try_from(args.merchant_url.as_str())?.with_timeouts(args.timeouts());
    let options = args.session_options(payer);
    let report = run_session(client, contract, payer, args.payer_config(), &options).await?;

    if let Some(err) = &report.stopped_by {
        tracing::warn!(error = %err, paid = report.paid, "Pay loop stopped early");
    }
    match &report.outcome {
        Outcome::Redeemed(response) => tracing::info!(
            tx = %response.tx_hash,
            tokens_used = ?response.tokens_used,
            "Payment channel redeemed successfully"
        ),
        Outcome::Reclaimed(confirmation) => {
            tracing::info!(tx = %confirmation.tx_hash, "Escrow reclaimed");
        }
        Outcome::Unsettled => tracing::warn!(
            merchant = %report.merchant,
            "Channel left open; run `reclaim` once the withdrawal window opens"
        ),
    }
    Ok(())
}

async fn reclaim(args: ReclaimArgs) -> Result<(), Box<dyn std::error::Error>> {
    let (payer, contract) = escrow(&args.chain)?;
    tracing::info!(
        payer = %payer,
        merchant = %args.merchant,
        token = %args.chain.token,
        "Reclaiming tokens"
    );
    let confirmation = contract
        .reclaim_channel(args.merchant, args.chain.token)
        .await?;
    tracing::info!(tx = %confirmation.tx_hash, "Tokens reclaimed successfully");
    Ok(())
}
