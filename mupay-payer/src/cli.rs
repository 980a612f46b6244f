//! Command-line arguments.
//!
//! Every argument falls back to an environment variable, so a `.env` file
//! is enough to drive a session.

use std::time::Duration;

use alloy_primitives::{Address, U256};
use alloy_signer_local::PrivateKeySigner;
use clap::{Args, Parser, Subcommand};
use mupay::proto::DataQuery;
use mupay::{ChannelError, PayerConfig};
use mupay_http::Timeouts;
use mupay_http::constants::DEFAULT_MERCHANT_URL;
use url::Url;

use crate::session::SessionOptions;

/// Payer agent for hash-chain payment channels.
#[derive(Parser, Debug)]
#[command(name = "mupay-payer", version, about, long_about = None)]
pub struct Cli {
    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Negotiate, open a channel, pay for data and have the merchant redeem.
    Run(RunArgs),
    /// Recover the escrow of a channel the merchant never redeemed.
    Reclaim(ReclaimArgs),
}

/// Escrow chain connection shared by all subcommands.
#[derive(Args, Debug, Clone)]
pub struct ChainArgs {
    /// HTTP RPC endpoint.
    #[arg(long, env = "RPC_URL")]
    pub rpc_url: Url,

    /// Payer private key (hex).
    #[arg(long, env = "PRIVATE_KEY", hide_env_values = true)]
    pub private_key: String,

    /// Escrow contract address.
    #[arg(long = "contract", env = "CONTRACT_ADDRESS")]
    pub contract: Address,

    /// Settlement asset; the zero address selects the native asset.
    #[arg(long = "token", env = "TOKEN_ADDRESS", default_value_t = Address::ZERO)]
    pub token: Address,

    /// Confirmations to wait for on every transaction.
    #[arg(long, env = "CONFIRMATIONS", default_value_t = 1)]
    pub confirmations: u64,

    /// Upper bound on the wait for a receipt, in seconds.
    #[arg(long, env = "RECEIPT_TIMEOUT_SECS", default_value_t = 30)]
    pub receipt_timeout_secs: u64,
}

impl ChainArgs {
    /// Parses the payer's signing key.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidConfiguration`] if the key is malformed.
    pub fn signer(&self) -> Result<PrivateKeySigner, ChannelError> {
        self.private_key
            .trim()
            .parse()
            .map_err(|e| ChannelError::InvalidConfiguration(format!("invalid private key: {e}")))
    }

    /// Receipt wait bound.
    #[must_use]
    pub const fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }
}

/// Arguments of `run`.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub chain: ChainArgs,

    /// Merchant agent base URL.
    #[arg(long, env = "MERCHANT_AGENT_URL", default_value = DEFAULT_MERCHANT_URL)]
    pub merchant_url: String,

    /// Amount to escrow, in the asset's smallest unit.
    #[arg(long, env = "CHANNEL_AMOUNT", default_value = "100000")]
    pub amount: U256,

    /// Hash chain length, i.e. the number of payable units.
    #[arg(long, env = "HASHCHAIN_LENGTH", default_value_t = 100)]
    pub hashchain_length: u64,

    /// Blocks after which the merchant may no longer redeem.
    #[arg(long, env = "MERCHANT_WITHDRAW_AFTER_BLOCKS", default_value_t = 10)]
    pub merchant_withdraw_after_blocks: u64,

    /// Blocks after which the payer may reclaim.
    #[arg(long, env = "PAYER_WITHDRAW_AFTER_BLOCKS", default_value_t = 20)]
    pub payer_withdraw_after_blocks: u64,

    /// Units to buy; the whole chain when unset.
    #[arg(long, env = "MAX_UNITS")]
    pub max_units: Option<u64>,

    /// Address to request data for; the payer's own address when unset.
    #[arg(long, env = "DATA_ADDRESS")]
    pub data_address: Option<Address>,

    /// How long to wait for the merchant to register the channel, in seconds.
    #[arg(long, env = "REGISTRATION_TIMEOUT_SECS", default_value_t = 30)]
    pub registration_timeout_secs: u64,

    /// Reclaim the escrow if the merchant fails to redeem.
    #[arg(long, env = "RECLAIM_ON_FAILURE")]
    pub reclaim_on_failure: bool,

    /// `POST /negotiate` timeout, in milliseconds.
    #[arg(long, env = "NEGOTIATE_TIMEOUT_MS", default_value_t = 10_000)]
    pub negotiate_timeout_ms: u64,

    /// `GET /data` timeout, in milliseconds.
    #[arg(long, env = "DATA_TIMEOUT_MS", default_value_t = 5_000)]
    pub data_timeout_ms: u64,

    /// `POST /payment` timeout, in milliseconds.
    #[arg(long, env = "PAYMENT_TIMEOUT_MS", default_value_t = 5_000)]
    pub payment_timeout_ms: u64,

    /// `POST /redeem` timeout, in milliseconds.
    #[arg(long, env = "REDEEM_TIMEOUT_MS", default_value_t = 10_000)]
    pub redeem_timeout_ms: u64,
}

impl RunArgs {
    /// The channel terms to propose.
    #[must_use]
    pub fn payer_config(&self) -> PayerConfig {
        PayerConfig {
            contract: self.chain.contract,
            token: self.chain.token,
            amount: self.amount,
            chain_length: self.hashchain_length,
            merchant_withdraw_after_blocks: self.merchant_withdraw_after_blocks,
            payer_withdraw_after_blocks: self.payer_withdraw_after_blocks,
        }
    }

    /// Per-endpoint request timeouts.
    #[must_use]
    pub const fn timeouts(&self) -> Timeouts {
        Timeouts {
            negotiate: Duration::from_millis(self.negotiate_timeout_ms),
            data: Duration::from_millis(self.data_timeout_ms),
            payment: Duration::from_millis(self.payment_timeout_ms),
            redeem: Duration::from_millis(self.redeem_timeout_ms),
        }
    }

    /// Session behavior for the payer at `payer`.
    #[must_use]
    pub fn session_options(&self, payer: Address) -> SessionOptions {
        SessionOptions {
            max_units: self.max_units.unwrap_or(self.hashchain_length),
            query: DataQuery {
                address: Some(self.data_address.unwrap_or(payer)),
            },
            registration_timeout: Duration::from_secs(self.registration_timeout_secs),
            reclaim_on_failure: self.reclaim_on_failure,
            ..SessionOptions::default()
        }
    }
}

/// Arguments of `reclaim`.
#[derive(Args, Debug, Clone)]
pub struct ReclaimArgs {
    #[command(flatten)]
    pub chain: ChainArgs,

    /// Merchant the channel was opened for.
    #[arg(long, env = "MERCHANT_ADDRESS")]
    pub merchant: Address,
}
