//! Interfaces of the external escrow ledger.
//!
//! The escrow contract holds channel funds, records each channel's trust
//! anchor and releases funds on redemption or reclaim. The protocol handlers
//! only see it through these traits; `mupay-evm` provides the on-chain
//! implementation and the tests use an in-memory fake.
//!
//! Every submitting method resolves only once the transaction is confirmed,
//! never on mere submission.

use std::future::Future;
use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

use crate::channel::Settlement;
use crate::error::ExternalLedgerError;

/// Arguments of the escrow ledger's channel-open entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenChannelParams {
    /// The merchant allowed to redeem.
    pub merchant: Address,
    /// Settlement asset; the zero address denotes the native asset.
    pub token: Address,
    /// Chain root `v[0]`.
    pub trust_anchor: B256,
    /// Escrowed amount in the asset's smallest unit.
    pub amount: U256,
    /// Chain length `N`.
    pub chain_length: u64,
    /// Blocks after which the merchant may no longer redeem.
    pub merchant_withdraw_after_blocks: u64,
    /// Blocks after which the payer may reclaim.
    pub payer_withdraw_after_blocks: u64,
}

/// The escrow ledger's channel-opened notification.
///
/// Treated as an untrusted hint: the merchant re-reads the authoritative
/// channel record before registering it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelOpened {
    /// The funding payer.
    pub payer: Address,
    /// The merchant the channel was opened for.
    pub merchant: Address,
    /// Settlement asset.
    pub token: Address,
    /// Escrowed amount.
    pub amount: U256,
    /// Chain length `N`.
    pub chain_length: u64,
    /// Block that included the open transaction, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
}

/// Authoritative on-chain record of an open channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnchainChannel {
    /// Chain root escrowed at open.
    pub trust_anchor: B256,
    /// Escrowed amount.
    pub amount: U256,
    /// Chain length `N`.
    pub chain_length: u64,
}

/// Proof that a submitted transaction was included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Confirmation {
    /// Transaction hash.
    pub tx_hash: B256,
    /// Including block, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
}

/// Channel entry points of the escrow ledger.
pub trait ChannelContract: Send + Sync {
    /// Escrows `amount` and records `trust_anchor` for a new channel.
    fn open_channel(
        &self,
        params: &OpenChannelParams,
    ) -> impl Future<Output = Result<Confirmation, ExternalLedgerError>> + Send;

    /// Reads the channel record for `(payer, merchant, token)`.
    ///
    /// Returns `None` if no such channel is open.
    fn channel(
        &self,
        payer: Address,
        merchant: Address,
        token: Address,
    ) -> impl Future<Output = Result<Option<OnchainChannel>, ExternalLedgerError>> + Send;

    /// Redeems `settlement.tokens_used` units to the merchant and returns the rest.
    fn redeem_channel(
        &self,
        settlement: &Settlement,
    ) -> impl Future<Output = Result<Confirmation, ExternalLedgerError>> + Send;

    /// Returns the whole escrow to the payer.
    fn reclaim_channel(
        &self,
        merchant: Address,
        token: Address,
    ) -> impl Future<Output = Result<Confirmation, ExternalLedgerError>> + Send;
}

/// Asset pre-authorization consulted before opening a channel.
pub trait AssetAllowance: Send + Sync {
    /// Amount of `token` that `spender` may currently pull from `owner`.
    fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> impl Future<Output = Result<U256, ExternalLedgerError>> + Send;

    /// Authorizes `spender` to pull `amount` of `token` from the signer.
    fn approve(
        &self,
        token: Address,
        spender: Address,
        amount: U256,
    ) -> impl Future<Output = Result<Confirmation, ExternalLedgerError>> + Send;
}

impl<T: ChannelContract> ChannelContract for Arc<T> {
    fn open_channel(
        &self,
        params: &OpenChannelParams,
    ) -> impl Future<Output = Result<Confirmation, ExternalLedgerError>> + Send {
        (**self).open_channel(params)
    }

    fn channel(
        &self,
        payer: Address,
        merchant: Address,
        token: Address,
    ) -> impl Future<Output = Result<Option<OnchainChannel>, ExternalLedgerError>> + Send {
        (**self).channel(payer, merchant, token)
    }

    fn redeem_channel(
        &self,
        settlement: &Settlement,
    ) -> impl Future<Output = Result<Confirmation, ExternalLedgerError>> + Send {
        (**self).redeem_channel(settlement)
    }

    fn reclaim_channel(
        &self,
        merchant: Address,
        token: Address,
    ) -> impl Future<Output = Result<Confirmation, ExternalLedgerError>> + Send {
        (**self).reclaim_channel(merchant, token)
    }
}

impl<T: AssetAllowance> AssetAllowance for Arc<T> {
    fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> impl Future<Output = Result<U256, ExternalLedgerError>> + Send {
        (**self).allowance(token, owner, spender)
    }

    fn approve(
        &self,
        token: Address,
        spender: Address,
        amount: U256,
    ) -> impl Future<Output = Result<Confirmation, ExternalLedgerError>> + Send {
        (**self).approve(token, spender, amount)
    }
}

/// In-memory escrow used by the protocol tests.
#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use tokio::sync::mpsc;

    use super::*;
    use crate::verify::verify;

    pub(crate) const ESCROW: Address = Address::repeat_byte(0xec);

    #[derive(Debug, Default)]
    pub(crate) struct FakeEscrow {
        /// The account signing payer-side calls.
        pub signer: Address,
        pub channels: Mutex<HashMap<(Address, Address, Address), OnchainChannel>>,
        pub allowances: Mutex<HashMap<(Address, Address), U256>>,
        pub redeemed: Mutex<Vec<Settlement>>,
        pub approvals: AtomicU64,
        pub fail_redeem: AtomicBool,
        /// Number of upcoming `channel` reads that fail.
        pub failing_lookups: AtomicU64,
        pub lookups: AtomicU64,
        pub events: Mutex<Option<mpsc::Sender<ChannelOpened>>>,
        nonce: AtomicU64,
    }

    impl FakeEscrow {
        pub(crate) fn new(signer: Address) -> Self {
            Self {
                signer,
                ..Self::default()
            }
        }

        fn confirmation(&self) -> Confirmation {
            let n = self.nonce.fetch_add(1, Ordering::Relaxed);
            Confirmation {
                tx_hash: B256::with_last_byte(u8::try_from(n % 256).unwrap_or(0)),
                block_number: Some(n),
            }
        }
    }

    impl ChannelContract for FakeEscrow {
        async fn open_channel(
            &self,
            params: &OpenChannelParams,
        ) -> Result<Confirmation, ExternalLedgerError> {
            if !params.token.is_zero() {
                let allowance = self
                    .allowances
                    .lock()
                    .unwrap()
                    .get(&(params.token, ESCROW))
                    .copied()
                    .unwrap_or_default();
                if allowance < params.amount {
                    return Err(ExternalLedgerError::new(
                        "createChannel",
                        "insufficient allowance",
                    ));
                }
            }
            let key = (self.signer, params.merchant, params.token);
            self.channels.lock().unwrap().insert(
                key,
                OnchainChannel {
                    trust_anchor: params.trust_anchor,
                    amount: params.amount,
                    chain_length: params.chain_length,
                },
            );
            let confirmation = self.confirmation();
            let sender = self.events.lock().unwrap().clone();
            if let Some(sender) = sender {
                let event = ChannelOpened {
                    payer: self.signer,
                    merchant: params.merchant,
                    token: params.token,
                    amount: params.amount,
                    chain_length: params.chain_length,
                    block_number: confirmation.block_number,
                };
                let _ = sender.send(event).await;
            }
            Ok(confirmation)
        }

        async fn channel(
            &self,
            payer: Address,
            merchant: Address,
            token: Address,
        ) -> Result<Option<OnchainChannel>, ExternalLedgerError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let failing = self.failing_lookups.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_lookups.store(failing - 1, Ordering::SeqCst);
                return Err(ExternalLedgerError::new("channelsMapping", "rpc timeout"));
            }
            Ok(self
                .channels
                .lock()
                .unwrap()
                .get(&(payer, merchant, token))
                .cloned())
        }

        async fn redeem_channel(
            &self,
            settlement: &Settlement,
        ) -> Result<Confirmation, ExternalLedgerError> {
            if self.fail_redeem.load(Ordering::SeqCst) {
                return Err(ExternalLedgerError::new("redeemChannel", "execution reverted"));
            }
            let mut channels = self.channels.lock().unwrap();
            let key = channels
                .keys()
                .find(|(payer, _, token)| *payer == settlement.payer && *token == settlement.token)
                .copied()
                .ok_or_else(|| ExternalLedgerError::new("redeemChannel", "channel not found"))?;
            let anchor = channels[&key].trust_anchor;
            if !verify(&anchor, &settlement.final_value, settlement.tokens_used) {
                return Err(ExternalLedgerError::new("redeemChannel", "invalid final value"));
            }
            channels.remove(&key);
            drop(channels);
            self.redeemed.lock().unwrap().push(*settlement);
            Ok(self.confirmation())
        }

        async fn reclaim_channel(
            &self,
            merchant: Address,
            token: Address,
        ) -> Result<Confirmation, ExternalLedgerError> {
            self.channels
                .lock()
                .unwrap()
                .remove(&(self.signer, merchant, token))
                .ok_or_else(|| ExternalLedgerError::new("reclaimChannel", "channel not found"))?;
            Ok(self.confirmation())
        }
    }

    impl AssetAllowance for FakeEscrow {
        async fn allowance(
            &self,
            token: Address,
            _owner: Address,
            spender: Address,
        ) -> Result<U256, ExternalLedgerError> {
            Ok(self
                .allowances
                .lock()
                .unwrap()
                .get(&(token, spender))
                .copied()
                .unwrap_or_default())
        }

        async fn approve(
            &self,
            token: Address,
            spender: Address,
            amount: U256,
        ) -> Result<Confirmation, ExternalLedgerError> {
            self.approvals.fetch_add(1, Ordering::SeqCst);
            self.allowances
                .lock()
                .unwrap()
                .insert((token, spender), amount);
            Ok(self.confirmation())
        }
    }
}
