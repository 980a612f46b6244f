//! One complete payer session against a remote merchant.
//!
//! Negotiate, open the channel on-chain, wait for the merchant to pick it up,
//! buy data one unit at a time, then ask the merchant to redeem. If the
//! merchant cannot redeem, the escrow can optionally be reclaimed.

use std::time::Duration;

use alloy_primitives::Address;
use mupay::proto::{DataQuery, RedeemResponse};
use mupay::{
    AssetAllowance, ChainSeed, Channel, ChannelContract, ChannelError, Confirmation, Payer,
    PayerConfig, TransportError,
};
use mupay_http::MerchantClient;
use tokio::time::Instant;

/// How a session behaves after the channel is open.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Units to buy before settling.
    pub max_units: u64,
    /// Query sent with every `/data` request.
    pub query: DataQuery,
    /// How long to wait for the merchant to register the channel.
    pub registration_timeout: Duration,
    /// Delay between registration checks.
    pub registration_poll: Duration,
    /// Reclaim the escrow if redemption fails.
    pub reclaim_on_failure: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_units: u64::MAX,
            query: DataQuery::default(),
            registration_timeout: Duration::from_secs(30),
            registration_poll: Duration::from_millis(500),
            reclaim_on_failure: false,
        }
    }
}

/// How the channel ended.
#[derive(Debug)]
pub enum Outcome {
    /// The merchant redeemed the channel.
    Redeemed(RedeemResponse),
    /// The payer recovered the escrow after a failed redemption.
    Reclaimed(Confirmation),
    /// Nothing was paid, so there was nothing to redeem. The escrow stays
    /// locked until the payer reclaims it.
    Unsettled,
}

/// Summary of a finished session.
#[derive(Debug)]
pub struct SessionReport {
    /// The merchant the channel was opened for.
    pub merchant: Address,
    /// The channel-open transaction.
    pub opened: Confirmation,
    /// Units paid.
    pub paid: u64,
    /// The failure that ended the pay loop early, if any.
    pub stopped_by: Option<ChannelError>,
    /// How the channel ended.
    pub outcome: Outcome,
}

/// Runs a full session for the payer at `payer`.
///
/// # Errors
///
/// Fails if negotiation, the channel open, or merchant registration fails,
/// and if redemption fails without a successful reclaim.
pub async fn run_session<C>(
    client: MerchantClient,
    contract: C,
    payer: Address,
    config: PayerConfig,
    options: &SessionOptions,
) -> Result<SessionReport, ChannelError>
where
    C: ChannelContract + AssetAllowance,
{
    let mut session = Payer::new(payer, config, client.clone(), contract)?;

    let merchant = session.negotiate().await?;
    let opened = session.open(&ChainSeed::random()).await?;
    let channel = wait_for_registration(&client, payer, options).await?;
    tracing::info!(
        merchant = %merchant,
        total_tokens = channel.total_tokens,
        "Merchant registered the channel"
    );

    let pay_loop = session.pay_loop(&options.query, options.max_units).await;
    tracing::info!(paid = pay_loop.paid, tokens_used = session.tokens_used(), "Pay loop finished");

    let outcome = if session.tokens_used() == 0 {
        tracing::warn!("Nothing was paid; reclaim the escrow once the withdrawal window opens");
        Outcome::Unsettled
    } else {
        match session.settle().await {
            Ok(response) => Outcome::Redeemed(response),
            Err(err) if options.reclaim_on_failure => {
                tracing::warn!(error = %err, "Redemption failed, reclaiming escrow");
                Outcome::Reclaimed(session.reclaim().await?)
            }
            Err(err) => return Err(err),
        }
    };

    Ok(SessionReport {
        merchant,
        opened,
        paid: pay_loop.paid,
        stopped_by: pay_loop.stopped_by,
        outcome,
    })
}

/// Polls the merchant until it reports the payer's channel as open.
///
/// # Errors
///
/// Returns [`ChannelError::Transport`] if the channel is not registered
/// within `options.registration_timeout`.
pub async fn wait_for_registration(
    client: &MerchantClient,
    payer: Address,
    options: &SessionOptions,
) -> Result<Channel, ChannelError> {
    let deadline = Instant::now() + options.registration_timeout;
    loop {
        match client.channel(payer).await {
            Ok(Some(channel)) => return Ok(channel),
            Ok(None) => tracing::debug!("Waiting for merchant to detect channel creation"),
            Err(err) => tracing::warn!(error = %err, "Channel lookup failed"),
        }
        if Instant::now() >= deadline {
            return Err(TransportError::new(
                "GET /channels/{payer}",
                "merchant did not register the channel in time",
            )
            .into());
        }
        tokio::time::sleep(options.registration_poll).await;
    }
}
