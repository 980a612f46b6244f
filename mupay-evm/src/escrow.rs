//! On-chain escrow ledger client.
//!
//! [`EvmChannelContract`] submits channel transactions through an alloy
//! [`Provider`] and resolves only once the receipt has the configured number
//! of confirmations. Receipt waits are bounded; a timeout or a reverted
//! receipt is reported as a failure and never as success.

use std::time::Duration;

use alloy_network::{Ethereum, EthereumWallet};
use alloy_primitives::{Address, U256};
use alloy_provider::{PendingTransactionBuilder, Provider, ProviderBuilder};
use alloy_signer_local::PrivateKeySigner;
use mupay::{
    AssetAllowance, ChannelContract, Confirmation, ExternalLedgerError, OnchainChannel,
    OpenChannelParams, Settlement,
};
use url::Url;

use crate::contract::{IERC20, IMuPay};
use crate::error::EvmContractError;
use crate::traced;

/// Block confirmations required before a transaction counts as final.
pub const DEFAULT_CONFIRMATIONS: u64 = 1;

/// Upper bound on waiting for a receipt.
pub const DEFAULT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connects a signing HTTP provider for `signer`.
pub fn connect(rpc_url: Url, signer: PrivateKeySigner) -> impl Provider + Clone {
    ProviderBuilder::new()
        .wallet(EthereumWallet::from(signer))
        .connect_http(rpc_url)
}

/// The escrow contract at `address`, reached through `provider`.
///
/// The provider's default signer is the account that opens and reclaims
/// channels (payer side) or redeems them (merchant side).
#[derive(Debug, Clone)]
pub struct EvmChannelContract<P> {
    provider: P,
    address: Address,
    confirmations: u64,
    receipt_timeout: Duration,
}

impl<P: Provider> EvmChannelContract<P> {
    /// Creates a client for the escrow contract deployed at `address`.
    pub const fn new(provider: P, address: Address) -> Self {
        Self {
            provider,
            address,
            confirmations: DEFAULT_CONFIRMATIONS,
            receipt_timeout: DEFAULT_RECEIPT_TIMEOUT,
        }
    }

    /// Sets the number of confirmations to wait for.
    #[must_use]
    pub const fn with_confirmations(mut self, confirmations: u64) -> Self {
        self.confirmations = confirmations;
        self
    }

    /// Sets the receipt timeout.
    #[must_use]
    pub const fn with_receipt_timeout(mut self, timeout: Duration) -> Self {
        self.receipt_timeout = timeout;
        self
    }

    /// The escrow contract's address.
    pub const fn address(&self) -> Address {
        self.address
    }

    /// Waits for `pending` to be confirmed and checks that it succeeded.
    async fn confirm(
        &self,
        pending: PendingTransactionBuilder<Ethereum>,
    ) -> Result<Confirmation, EvmContractError> {
        let tx_hash = *pending.tx_hash();
        #[cfg(feature = "telemetry")]
        tracing::debug!(tx = %tx_hash, confirmations = self.confirmations, "Waiting for receipt");
        let receipt = pending
            .with_required_confirmations(self.confirmations)
            .with_timeout(Some(self.receipt_timeout))
            .get_receipt()
            .await?;
        if !receipt.status() {
            #[cfg(feature = "telemetry")]
            tracing::warn!(tx = %tx_hash, "Transaction reverted");
            return Err(EvmContractError::TransactionReverted(tx_hash));
        }
        Ok(Confirmation {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
        })
    }

    /// Calls `createChannel`, sending `amount` as value for native-asset channels.
    ///
    /// # Errors
    ///
    /// Fails if the chain length does not fit `uint16`, or if the transaction
    /// cannot be sent, times out, or reverts.
    pub async fn create_channel(
        &self,
        params: &OpenChannelParams,
    ) -> Result<Confirmation, EvmContractError> {
        let number_of_tokens = u16::try_from(params.chain_length).map_err(|_| {
            EvmContractError::InvalidArgument(format!(
                "chain length {} exceeds uint16",
                params.chain_length
            ))
        })?;
        let escrow = IMuPay::new(self.address, &self.provider);
        let mut call = escrow.createChannel(
            params.merchant,
            params.token,
            params.trust_anchor,
            params.amount,
            number_of_tokens,
            params.merchant_withdraw_after_blocks,
            params.payer_withdraw_after_blocks,
        );
        if params.token.is_zero() {
            call = call.value(params.amount);
        }
        let pending = traced!(
            call.send(),
            tracing::info_span!("create_channel", merchant = %params.merchant, token = %params.token)
        )?;
        self.confirm(pending).await
    }

    /// Reads `channelsMapping(payer, merchant, token)`.
    ///
    /// An all-zero trust anchor means no channel is open.
    ///
    /// # Errors
    ///
    /// Fails if the view call fails.
    pub async fn channels_mapping(
        &self,
        payer: Address,
        merchant: Address,
        token: Address,
    ) -> Result<Option<OnchainChannel>, EvmContractError> {
        let escrow = IMuPay::new(self.address, &self.provider);
        let record = traced!(
            escrow.channelsMapping(payer, merchant, token).call(),
            tracing::debug_span!("channels_mapping", payer = %payer)
        )?;
        if record.trustAnchor.is_zero() {
            return Ok(None);
        }
        Ok(Some(OnchainChannel {
            trust_anchor: record.trustAnchor,
            amount: record.amount,
            chain_length: u64::from(record.numberOfTokens),
        }))
    }

    /// Calls `redeemChannel` with the settlement tuple.
    ///
    /// # Errors
    ///
    /// Fails if the transaction cannot be sent, times out, or reverts.
    pub async fn redeem(&self, settlement: &Settlement) -> Result<Confirmation, EvmContractError> {
        let escrow = IMuPay::new(self.address, &self.provider);
        let call = escrow.redeemChannel(
            settlement.payer,
            settlement.token,
            settlement.final_value,
            U256::from(settlement.tokens_used),
        );
        let pending = traced!(
            call.send(),
            tracing::info_span!("redeem_channel", payer = %settlement.payer, tokens_used = settlement.tokens_used)
        )?;
        self.confirm(pending).await
    }

    /// Calls `reclaimChannel`.
    ///
    /// # Errors
    ///
    /// Fails if the transaction cannot be sent, times out, or reverts.
    pub async fn reclaim(
        &self,
        merchant: Address,
        token: Address,
    ) -> Result<Confirmation, EvmContractError> {
        let escrow = IMuPay::new(self.address, &self.provider);
        let call = escrow.reclaimChannel(merchant, token);
        let pending = traced!(
            call.send(),
            tracing::info_span!("reclaim_channel", merchant = %merchant)
        )?;
        self.confirm(pending).await
    }

    /// Reads the ERC-20 allowance of `spender` over `owner`'s tokens.
    ///
    /// # Errors
    ///
    /// Fails if the view call fails.
    pub async fn token_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, EvmContractError> {
        let erc20 = IERC20::new(token, &self.provider);
        Ok(erc20.allowance(owner, spender).call().await?)
    }

    /// Approves `spender` for `amount` of `token`.
    ///
    /// # Errors
    ///
    /// Fails if the transaction cannot be sent, times out, or reverts.
    pub async fn approve_token(
        &self,
        token: Address,
        spender: Address,
        amount: U256,
    ) -> Result<Confirmation, EvmContractError> {
        let erc20 = IERC20::new(token, &self.provider);
        let pending = traced!(
            erc20.approve(spender, amount).send(),
            tracing::info_span!("approve", token = %token, spender = %spender)
        )?;
        self.confirm(pending).await
    }
}

impl<P: Provider> ChannelContract for EvmChannelContract<P> {
    async fn open_channel(
        &self,
        params: &OpenChannelParams,
    ) -> Result<Confirmation, ExternalLedgerError> {
        self.create_channel(params)
            .await
            .map_err(|e| e.into_ledger_error("createChannel"))
    }

    async fn channel(
        &self,
        payer: Address,
        merchant: Address,
        token: Address,
    ) -> Result<Option<OnchainChannel>, ExternalLedgerError> {
        self.channels_mapping(payer, merchant, token)
            .await
            .map_err(|e| e.into_ledger_error("channelsMapping"))
    }

    async fn redeem_channel(
        &self,
        settlement: &Settlement,
    ) -> Result<Confirmation, ExternalLedgerError> {
        self.redeem(settlement)
            .await
            .map_err(|e| e.into_ledger_error("redeemChannel"))
    }

    async fn reclaim_channel(
        &self,
        merchant: Address,
        token: Address,
    ) -> Result<Confirmation, ExternalLedgerError> {
        self.reclaim(merchant, token)
            .await
            .map_err(|e| e.into_ledger_error("reclaimChannel"))
    }
}

impl<P: Provider> AssetAllowance for EvmChannelContract<P> {
    async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, ExternalLedgerError> {
        self.token_allowance(token, owner, spender)
            .await
            .map_err(|e| e.into_ledger_error("allowance"))
    }

    async fn approve(
        &self,
        token: Address,
        spender: Address,
        amount: U256,
    ) -> Result<Confirmation, ExternalLedgerError> {
        self.approve_token(token, spender, amount)
            .await
            .map_err(|e| e.into_ledger_error("approve"))
    }
}
