//! Payer-side protocol handler.
//!
//! [`Payer`] drives one channel session through
//! `Negotiating -> Opening -> Open -> Settling -> Closed`, or through
//! `Open -> Reclaiming -> Reclaimed` when the merchant does not settle.
//! The merchant is reached through a [`MerchantTransport`] and the escrow
//! ledger through [`ChannelContract`] + [`AssetAllowance`].
//!
//! The pay loop is sequential: each disclosure waits for the previous
//! acknowledgment. Any rejection ends the loop, since a chain position is
//! single-use and re-disclosing is left to the caller.

use std::future::Future;
use std::sync::Arc;

use alloy_primitives::{Address, U256};
use serde_json::Value;

use crate::channel::ChannelState;
use crate::contract::{AssetAllowance, ChannelContract, Confirmation, OpenChannelParams};
use crate::error::{ChannelError, InvalidTokenReason, TransportError};
use crate::hashchain::{ChainSeed, HashChain, MAX_CHAIN_LENGTH};
use crate::proto::{
    DataQuery, NegotiateRequest, NegotiateResponse, PaymentRequest, PaymentResponse, RedeemRequest,
    RedeemResponse,
};

/// Message exchange with a merchant.
pub trait MerchantTransport: Send + Sync {
    /// Proposes channel terms.
    fn negotiate(
        &self,
        request: &NegotiateRequest,
    ) -> impl Future<Output = Result<NegotiateResponse, TransportError>> + Send;

    /// Requests one unit of the metered resource.
    fn fetch_data(
        &self,
        query: &DataQuery,
    ) -> impl Future<Output = Result<Value, TransportError>> + Send;

    /// Discloses a chain value.
    fn pay(
        &self,
        request: &PaymentRequest,
    ) -> impl Future<Output = Result<PaymentResponse, TransportError>> + Send;

    /// Asks the merchant to settle the channel.
    fn redeem(
        &self,
        request: &RedeemRequest,
    ) -> impl Future<Output = Result<RedeemResponse, TransportError>> + Send;
}

impl<T: MerchantTransport> MerchantTransport for Arc<T> {
    fn negotiate(
        &self,
        request: &NegotiateRequest,
    ) -> impl Future<Output = Result<NegotiateResponse, TransportError>> + Send {
        (**self).negotiate(request)
    }

    fn fetch_data(
        &self,
        query: &DataQuery,
    ) -> impl Future<Output = Result<Value, TransportError>> + Send {
        (**self).fetch_data(query)
    }

    fn pay(
        &self,
        request: &PaymentRequest,
    ) -> impl Future<Output = Result<PaymentResponse, TransportError>> + Send {
        (**self).pay(request)
    }

    fn redeem(
        &self,
        request: &RedeemRequest,
    ) -> impl Future<Output = Result<RedeemResponse, TransportError>> + Send {
        (**self).redeem(request)
    }
}

/// Channel terms the payer proposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayerConfig {
    /// Escrow contract; also the spender of the asset allowance.
    pub contract: Address,
    /// Settlement asset; the zero address denotes the native asset.
    pub token: Address,
    /// Amount to escrow.
    pub amount: U256,
    /// Chain length `N`.
    pub chain_length: u64,
    /// Blocks after which the merchant may no longer redeem.
    pub merchant_withdraw_after_blocks: u64,
    /// Blocks after which the payer may reclaim.
    pub payer_withdraw_after_blocks: u64,
}

impl PayerConfig {
    /// Checks the terms before anything is sent.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidConfiguration`] for a zero amount or an
    /// out-of-range chain length.
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.amount == U256::ZERO {
            return Err(ChannelError::InvalidConfiguration(
                "channel amount must be positive".into(),
            ));
        }
        if self.chain_length == 0 || self.chain_length > MAX_CHAIN_LENGTH {
            return Err(ChannelError::InvalidConfiguration(format!(
                "hashchain length must be between 1 and {MAX_CHAIN_LENGTH}, got {}",
                self.chain_length
            )));
        }
        Ok(())
    }

    fn uses_native_asset(&self) -> bool {
        self.token.is_zero()
    }
}

/// Result of a pay loop.
#[derive(Debug)]
pub struct PayLoop {
    /// Units paid during this loop.
    pub paid: u64,
    /// The failure that ended the loop early, if any.
    pub stopped_by: Option<ChannelError>,
}

/// One payer-side channel session.
#[derive(Debug)]
pub struct Payer<T, C> {
    address: Address,
    config: PayerConfig,
    transport: T,
    contract: C,
    state: ChannelState,
    merchant: Option<Address>,
    chain: Option<HashChain>,
    tokens_used: u64,
}

impl<T, C> Payer<T, C>
where
    T: MerchantTransport,
    C: ChannelContract + AssetAllowance,
{
    /// Starts a session for the payer at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidConfiguration`] if `config` is invalid.
    pub fn new(
        address: Address,
        config: PayerConfig,
        transport: T,
        contract: C,
    ) -> Result<Self, ChannelError> {
        config.validate()?;
        Ok(Self {
            address,
            config,
            transport,
            contract,
            state: ChannelState::Negotiating,
            merchant: None,
            chain: None,
            tokens_used: 0,
        })
    }

    /// The payer's address.
    pub const fn address(&self) -> Address {
        self.address
    }

    /// Current session state.
    pub const fn state(&self) -> ChannelState {
        self.state
    }

    /// The negotiated merchant, once known.
    pub const fn merchant(&self) -> Option<Address> {
        self.merchant
    }

    /// Units acknowledged by the merchant so far.
    pub const fn tokens_used(&self) -> u64 {
        self.tokens_used
    }

    /// Units left on the chain.
    pub const fn remaining(&self) -> u64 {
        self.config.chain_length.saturating_sub(self.tokens_used)
    }

    fn expect_state(&self, expected: ChannelState) -> Result<(), ChannelError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ChannelError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    fn negotiated_merchant(&self) -> Result<Address, ChannelError> {
        self.merchant.ok_or(ChannelError::InvalidState {
            expected: ChannelState::Negotiating,
            actual: self.state,
        })
    }

    /// Proposes the configured terms and records the merchant's address.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::InvalidState`] outside `Negotiating`
    /// - [`ChannelError::Transport`] if the merchant does not accept
    pub async fn negotiate(&mut self) -> Result<Address, ChannelError> {
        self.expect_state(ChannelState::Negotiating)?;
        let request = NegotiateRequest {
            payer: self.address,
            contract: self.config.contract,
            token: self.config.token,
            amount: self.config.amount,
        };
        let response = self.transport.negotiate(&request).await?;
        #[cfg(feature = "telemetry")]
        tracing::info!(merchant = %response.merchant_address, message = %response.message, "Negotiated channel terms");
        self.merchant = Some(response.merchant_address);
        Ok(response.merchant_address)
    }

    /// Makes sure the escrow contract may pull the channel amount.
    ///
    /// Native-asset channels need no allowance. Otherwise the current
    /// allowance is checked first and an approval is only submitted if it
    /// falls short. Returns the approval's confirmation, if one was needed.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ExternalLedger`] if the query or approval fails.
    pub async fn ensure_allowance(&self) -> Result<Option<Confirmation>, ChannelError> {
        if self.config.uses_native_asset() {
            return Ok(None);
        }
        let current = self
            .contract
            .allowance(self.config.token, self.address, self.config.contract)
            .await?;
        #[cfg(feature = "telemetry")]
        tracing::debug!(token = %self.config.token, allowance = %current, "Current token allowance");
        if current >= self.config.amount {
            return Ok(None);
        }
        #[cfg(feature = "telemetry")]
        tracing::info!(token = %self.config.token, amount = %self.config.amount, "Approving token allowance");
        let confirmation = self
            .contract
            .approve(self.config.token, self.config.contract, self.config.amount)
            .await?;
        Ok(Some(confirmation))
    }

    /// Generates the hash chain and opens the channel on the escrow ledger.
    ///
    /// Resolves once the open transaction is confirmed. If the allowance step
    /// or the open itself fails, the session returns to `Negotiating` since
    /// nothing has been escrowed.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::InvalidState`] before negotiation or outside `Negotiating`
    /// - [`ChannelError::ExternalLedger`] if the approval or open fails
    pub async fn open(&mut self, seed: &ChainSeed) -> Result<Confirmation, ChannelError> {
        self.expect_state(ChannelState::Negotiating)?;
        let merchant = self.negotiated_merchant()?;
        let chain = HashChain::generate(seed, self.config.chain_length)?;

        self.state.transition(ChannelState::Opening)?;
        let result = self.submit_open(merchant, &chain).await;
        match result {
            Ok(confirmation) => {
                self.state.transition(ChannelState::Open)?;
                #[cfg(feature = "telemetry")]
                tracing::info!(
                    merchant = %merchant,
                    trust_anchor = %chain.anchor(),
                    tx = %confirmation.tx_hash,
                    "Payment channel opened"
                );
                self.chain = Some(chain);
                self.tokens_used = 0;
                Ok(confirmation)
            }
            Err(err) => {
                self.state = ChannelState::Negotiating;
                Err(err)
            }
        }
    }

    async fn submit_open(
        &self,
        merchant: Address,
        chain: &HashChain,
    ) -> Result<Confirmation, ChannelError> {
        self.ensure_allowance().await?;
        let params = OpenChannelParams {
            merchant,
            token: self.config.token,
            trust_anchor: chain.anchor(),
            amount: self.config.amount,
            chain_length: chain.length(),
            merchant_withdraw_after_blocks: self.config.merchant_withdraw_after_blocks,
            payer_withdraw_after_blocks: self.config.payer_withdraw_after_blocks,
        };
        Ok(self.contract.open_channel(&params).await?)
    }

    /// Requests one unit of the metered resource.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::InvalidState`] outside `Open`
    /// - [`ChannelError::Transport`] if the request fails
    pub async fn fetch_data(&self, query: &DataQuery) -> Result<Value, ChannelError> {
        self.expect_state(ChannelState::Open)?;
        Ok(self.transport.fetch_data(query).await?)
    }

    /// Pays for `steps` more units by disclosing the matching chain value.
    ///
    /// Returns the cumulative units paid.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::InvalidState`] outside `Open`
    /// - [`ChannelError::InvalidToken`] for zero steps or more than remain
    /// - [`ChannelError::Transport`] if the merchant rejects the disclosure
    pub async fn pay(&mut self, steps: u64) -> Result<u64, ChannelError> {
        self.expect_state(ChannelState::Open)?;
        let payer = self.address;
        let reject = move |reason| ChannelError::InvalidToken { payer, reason };
        if steps == 0 {
            return Err(reject(InvalidTokenReason::ZeroSteps));
        }
        let remaining = self.remaining();
        if steps > remaining {
            return Err(reject(InvalidTokenReason::ExceedsBudget {
                requested: steps,
                remaining,
            }));
        }
        let target = self.tokens_used + steps;
        let preimage = self
            .chain
            .as_ref()
            .and_then(|chain| chain.token(target))
            .ok_or_else(|| {
                reject(InvalidTokenReason::ExceedsBudget {
                    requested: steps,
                    remaining,
                })
            })?;

        let request = PaymentRequest {
            payer_address: self.address,
            preimage,
            tokens_used: steps,
        };
        let _response = self.transport.pay(&request).await?;
        self.tokens_used = target;
        #[cfg(feature = "telemetry")]
        tracing::info!(tokens_used = target, message = %_response.message, "Payment acknowledged");
        Ok(target)
    }

    /// Fetches a unit of data and pays one step for it, up to `max_units`
    /// times or until the chain is exhausted.
    ///
    /// Stops at the first failure and reports it in [`PayLoop::stopped_by`];
    /// the channel stays `Open` so it can still be settled or reclaimed.
    pub async fn pay_loop(&mut self, query: &DataQuery, max_units: u64) -> PayLoop {
        let mut paid = 0;
        while paid < max_units && self.remaining() > 0 {
            match self.pay_for_data(query).await {
                Ok(_) => paid += 1,
                Err(err) => {
                    #[cfg(feature = "telemetry")]
                    tracing::warn!(error = %err, paid, "Pay loop stopped");
                    return PayLoop {
                        paid,
                        stopped_by: Some(err),
                    };
                }
            }
        }
        PayLoop {
            paid,
            stopped_by: None,
        }
    }

    async fn pay_for_data(&mut self, query: &DataQuery) -> Result<u64, ChannelError> {
        let _data = self.fetch_data(query).await?;
        #[cfg(feature = "telemetry")]
        tracing::debug!(data = %_data, "Received data from merchant");
        self.pay(1).await
    }

    /// Asks the merchant to redeem the channel.
    ///
    /// On failure the session returns to `Open` so settlement can be retried
    /// or the escrow reclaimed.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::InvalidState`] outside `Open`
    /// - [`ChannelError::Transport`] if the merchant does not confirm
    pub async fn settle(&mut self) -> Result<RedeemResponse, ChannelError> {
        self.state.transition(ChannelState::Settling)?;
        let request = RedeemRequest {
            payer_address: self.address,
        };
        match self.transport.redeem(&request).await {
            Ok(response) => {
                self.state.transition(ChannelState::Closed)?;
                #[cfg(feature = "telemetry")]
                tracing::info!(tx = %response.tx_hash, tokens_used = self.tokens_used, "Payment channel redeemed");
                Ok(response)
            }
            Err(err) => {
                self.state.transition(ChannelState::Open)?;
                Err(err.into())
            }
        }
    }

    /// Recovers the whole escrow without the merchant's cooperation.
    ///
    /// On failure (typically because the withdrawal block threshold has not
    /// been reached) the session returns to `Open`.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::InvalidState`] outside `Open` and `Settling`
    /// - [`ChannelError::ExternalLedger`] if the reclaim fails
    pub async fn reclaim(&mut self) -> Result<Confirmation, ChannelError> {
        let merchant = self.negotiated_merchant()?;
        self.state.transition(ChannelState::Reclaiming)?;
        match self.contract.reclaim_channel(merchant, self.config.token).await {
            Ok(confirmation) => {
                self.state.transition(ChannelState::Reclaimed)?;
                #[cfg(feature = "telemetry")]
                tracing::info!(merchant = %merchant, tx = %confirmation.tx_hash, "Channel reclaimed");
                Ok(confirmation)
            }
            Err(err) => {
                self.state.transition(ChannelState::Open)?;
                Err(err.into())
            }
        }
    }
}
