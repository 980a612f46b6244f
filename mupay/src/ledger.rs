//! Merchant-side channel ledger.
//!
//! [`ChannelLedger`] is the authoritative in-memory record of every open
//! channel, keyed by payer. Each payer owns a slot guarded by its own async
//! mutex, so registration, payment and settlement for one payer are strictly
//! serialized while different payers proceed in parallel.
//!
//! - **Registration** inserts a channel only if none is tracked for the payer.
//! - **Payment** runs the cheap bounds checks first, then the hash check, and
//!   advances `latest_accepted` / `tokens_used` under the slot lock.
//! - **Settlement** holds the slot lock across the external redemption call and
//!   only clears the slot once the call has been confirmed.

use std::future::Future;
use std::sync::Arc;

use alloy_primitives::{Address, B256};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::channel::{Channel, Settlement};
use crate::error::{ChannelError, ExternalLedgerError, InvalidTokenReason};
use crate::verify::verify;

/// Whether a single disclosure may pay for more than one unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepPolicy {
    /// Any positive step count within the remaining budget is accepted.
    #[default]
    AllowSkips,
    /// Every disclosure must advance the chain by exactly one value.
    SingleStep,
}

/// Outcome of a channel registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The channel is now tracked.
    Registered,
    /// A channel was already tracked for the payer; nothing changed.
    Duplicate,
}

type Slot = Arc<Mutex<Option<Channel>>>;

/// Channel store with per-payer mutual exclusion.
///
/// A settled payer's slot is emptied under its lock and then dropped from the
/// map, unless another task still holds a handle to it.
#[derive(Debug, Default)]
pub struct ChannelLedger {
    channels: DashMap<Address, Slot>,
    policy: StepPolicy,
}

impl ChannelLedger {
    /// Creates an empty ledger accepting multi-step disclosures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty ledger with the given step policy.
    #[must_use]
    pub fn with_policy(policy: StepPolicy) -> Self {
        Self {
            channels: DashMap::new(),
            policy,
        }
    }

    /// The step policy enforced on payments.
    #[must_use]
    pub const fn policy(&self) -> StepPolicy {
        self.policy
    }

    /// Returns the payer's slot, creating an empty one if needed.
    fn slot(&self, payer: Address) -> Slot {
        // Clone the Arc out so the shard lock is not held across an await.
        let entry = self.channels.entry(payer).or_default();
        Arc::clone(entry.value())
    }

    fn existing_slot(&self, payer: Address) -> Option<Slot> {
        self.channels.get(&payer).map(|entry| Arc::clone(entry.value()))
    }

    /// Drops the payer's slot if it is empty and `slot` is the only handle
    /// outside the map.
    fn prune(&self, payer: Address, slot: Slot) {
        // Handles can only be cloned under the shard lock held by `remove_if`.
        self.channels.remove_if(&payer, |_, current| {
            Arc::ptr_eq(current, &slot)
                && Arc::strong_count(current) == 2
                && current.try_lock().is_ok_and(|guard| guard.is_none())
        });
    }

    /// Starts tracking `channel` unless its payer already has one.
    ///
    /// Duplicate registrations are expected (repeated or late notifications)
    /// and leave the existing channel untouched.
    pub async fn register(&self, channel: Channel) -> Registration {
        let payer = channel.payer;
        let slot = self.slot(payer);
        let mut guard = slot.lock().await;
        if guard.is_some() {
            #[cfg(feature = "telemetry")]
            tracing::warn!(payer = %payer, "Channel already exists, skipping registration");
            return Registration::Duplicate;
        }
        #[cfg(feature = "telemetry")]
        tracing::info!(
            payer = %payer,
            token = %channel.token,
            trust_anchor = %channel.trust_anchor,
            total_tokens = channel.total_tokens,
            "Channel registered"
        );
        *guard = Some(channel);
        Registration::Registered
    }

    /// Accepts `disclosed` as payment for `steps` more units.
    ///
    /// Returns the cumulative units paid after this payment.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::ChannelNotFound`] if no channel is tracked for `payer`
    /// - [`ChannelError::InvalidToken`] if the step count is out of bounds or
    ///   the disclosed value does not hash to the latest accepted value
    pub async fn record_payment(
        &self,
        payer: Address,
        disclosed: B256,
        steps: u64,
    ) -> Result<u64, ChannelError> {
        let slot = self
            .existing_slot(payer)
            .ok_or(ChannelError::ChannelNotFound(payer))?;
        let mut guard = slot.lock().await;
        let channel = guard
            .as_mut()
            .ok_or(ChannelError::ChannelNotFound(payer))?;

        let reject = |reason| ChannelError::InvalidToken { payer, reason };
        if steps == 0 {
            return Err(reject(InvalidTokenReason::ZeroSteps));
        }
        if self.policy == StepPolicy::SingleStep && steps != 1 {
            return Err(reject(InvalidTokenReason::SkipNotAllowed { requested: steps }));
        }
        let remaining = channel.remaining();
        if steps > remaining {
            return Err(reject(InvalidTokenReason::ExceedsBudget {
                requested: steps,
                remaining,
            }));
        }
        if !verify(&channel.latest_accepted, &disclosed, steps) {
            #[cfg(feature = "telemetry")]
            tracing::warn!(payer = %payer, steps, "Hashchain verification failed");
            return Err(reject(InvalidTokenReason::HashMismatch));
        }

        channel.latest_accepted = disclosed;
        channel.tokens_used += steps;
        #[cfg(feature = "telemetry")]
        tracing::debug!(
            payer = %payer,
            steps,
            tokens_used = channel.tokens_used,
            "Payment accepted"
        );
        Ok(channel.tokens_used)
    }

    /// Returns the settlement tuple the payer's channel would redeem with.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::ChannelNotFound`] if no channel is tracked for `payer`
    /// - [`ChannelError::NothingToSettle`] if nothing has been paid yet
    pub async fn pending_settlement(&self, payer: Address) -> Result<Settlement, ChannelError> {
        let slot = self
            .existing_slot(payer)
            .ok_or(ChannelError::ChannelNotFound(payer))?;
        let guard = slot.lock().await;
        settleable(payer, guard.as_ref())
    }

    /// Settles the payer's channel through `redeem`.
    ///
    /// `redeem` receives the settlement tuple and must resolve only once the
    /// escrow ledger has confirmed the redemption. The channel is removed on
    /// success and left intact, ready for a retry, on failure. No payment for
    /// the payer can interleave with the redemption.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::ChannelNotFound`] if no channel is tracked for `payer`
    /// - [`ChannelError::NothingToSettle`] if nothing has been paid yet
    /// - [`ChannelError::ExternalLedger`] if `redeem` fails
    pub async fn settle<F, Fut, T>(
        &self,
        payer: Address,
        redeem: F,
    ) -> Result<(Settlement, T), ChannelError>
    where
        F: FnOnce(Settlement) -> Fut,
        Fut: Future<Output = Result<T, ExternalLedgerError>>,
    {
        let slot = self
            .existing_slot(payer)
            .ok_or(ChannelError::ChannelNotFound(payer))?;
        let mut guard = slot.lock().await;
        let settlement = settleable(payer, guard.as_ref())?;
        let confirmation = redeem(settlement).await?;
        *guard = None;
        drop(guard);
        self.prune(payer, slot);
        #[cfg(feature = "telemetry")]
        tracing::info!(
            payer = %payer,
            tokens_used = settlement.tokens_used,
            "Channel settled and removed"
        );
        Ok((settlement, confirmation))
    }

    /// A snapshot of the payer's channel, if one is tracked.
    pub async fn get(&self, payer: Address) -> Option<Channel> {
        let slot = self.existing_slot(payer)?;
        let guard = slot.lock().await;
        guard.clone()
    }

    /// Snapshots of every tracked channel.
    pub async fn snapshot(&self) -> Vec<Channel> {
        let slots: Vec<Slot> = self
            .channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut channels = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(channel) = slot.lock().await.clone() {
                channels.push(channel);
            }
        }
        channels
    }
}

fn settleable(payer: Address, channel: Option<&Channel>) -> Result<Settlement, ChannelError> {
    let channel = channel.ok_or(ChannelError::ChannelNotFound(payer))?;
    if channel.tokens_used == 0 {
        return Err(ChannelError::NothingToSettle(payer));
    }
    Ok(channel.settlement())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashchain::{ChainSeed, HashChain};

    const PAYER: Address = Address::repeat_byte(0xaa);
    const TOKEN: Address = Address::repeat_byte(0x70);

    fn chain(length: u64) -> HashChain {
        HashChain::generate(&ChainSeed::from_bytes([42; 32]), length).unwrap()
    }

    async fn ledger_with(chain: &HashChain, policy: StepPolicy) -> ChannelLedger {
        let ledger = ChannelLedger::with_policy(policy);
        let channel = Channel::open(PAYER, TOKEN, chain.anchor(), chain.length());
        assert_eq!(ledger.register(channel).await, Registration::Registered);
        ledger
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let chain = chain(5);
        let ledger = ledger_with(&chain, StepPolicy::AllowSkips).await;
        ledger.record_payment(PAYER, chain.token(1).unwrap(), 1).await.unwrap();

        let again = Channel::open(PAYER, TOKEN, B256::repeat_byte(9), 50);
        assert_eq!(ledger.register(again).await, Registration::Duplicate);

        let stored = ledger.get(PAYER).await.unwrap();
        assert_eq!(stored.trust_anchor, chain.anchor());
        assert_eq!(stored.tokens_used, 1);
        assert_eq!(ledger.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_payment_for_unknown_payer() {
        let ledger = ChannelLedger::new();
        let err = ledger
            .record_payment(PAYER, B256::ZERO, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::ChannelNotFound(p) if p == PAYER));
    }

    #[tokio::test]
    async fn test_incremental_and_skipping_payments() {
        let chain = chain(5);
        let ledger = ledger_with(&chain, StepPolicy::AllowSkips).await;
        assert_eq!(ledger.record_payment(PAYER, chain.token(1).unwrap(), 1).await.unwrap(), 1);
        assert_eq!(ledger.record_payment(PAYER, chain.token(3).unwrap(), 2).await.unwrap(), 3);
        let channel = ledger.get(PAYER).await.unwrap();
        assert_eq!(channel.latest_accepted, chain.token(3).unwrap());
        assert_eq!(channel.remaining(), 2);
    }

    #[tokio::test]
    async fn test_replay_is_invalid_token() {
        let chain = chain(5);
        let ledger = ledger_with(&chain, StepPolicy::AllowSkips).await;
        ledger.record_payment(PAYER, chain.token(1).unwrap(), 1).await.unwrap();
        ledger.record_payment(PAYER, chain.token(2).unwrap(), 1).await.unwrap();
        for steps in 1..=3 {
            let err = ledger
                .record_payment(PAYER, chain.token(2).unwrap(), steps)
                .await
                .unwrap_err();
            assert!(matches!(err, ChannelError::InvalidToken { .. }), "steps = {steps}");
        }
        let err = ledger
            .record_payment(PAYER, chain.token(1).unwrap(), 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::InvalidToken {
                reason: InvalidTokenReason::HashMismatch,
                ..
            }
        ));
        assert_eq!(ledger.get(PAYER).await.unwrap().tokens_used, 2);
    }

    #[tokio::test]
    async fn test_budget_checked_before_hash() {
        let chain = chain(3);
        let ledger = ledger_with(&chain, StepPolicy::AllowSkips).await;
        // A garbage value would fail the hash check; the budget error must win.
        let err = ledger
            .record_payment(PAYER, B256::repeat_byte(0xff), 4)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::InvalidToken {
                reason: InvalidTokenReason::ExceedsBudget {
                    requested: 4,
                    remaining: 3
                },
                ..
            }
        ));
        let err = ledger
            .record_payment(PAYER, B256::repeat_byte(0xff), 0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::InvalidToken {
                reason: InvalidTokenReason::ZeroSteps,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_single_step_policy() {
        let chain = chain(5);
        let ledger = ledger_with(&chain, StepPolicy::SingleStep).await;
        let err = ledger
            .record_payment(PAYER, chain.token(2).unwrap(), 2)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::InvalidToken {
                reason: InvalidTokenReason::SkipNotAllowed { requested: 2 },
                ..
            }
        ));
        assert_eq!(ledger.record_payment(PAYER, chain.token(1).unwrap(), 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_tokens_used_is_monotonic_and_bounded() {
        let chain = chain(12);
        let ledger = ledger_with(&chain, StepPolicy::AllowSkips).await;
        let mut paid = 0;
        let mut last = 0;
        for steps in [1, 3, 2, 5, 4, 1] {
            let target = paid + steps;
            let Some(token) = chain.token(target) else {
                let err = ledger
                    .record_payment(PAYER, B256::ZERO, steps)
                    .await
                    .unwrap_err();
                assert!(matches!(err, ChannelError::InvalidToken { .. }));
                continue;
            };
            let used = ledger.record_payment(PAYER, token, steps).await.unwrap();
            assert!(used >= last);
            assert!(used <= chain.length());
            last = used;
            paid = target;
        }
        assert!(ledger.get(PAYER).await.unwrap().is_exhausted());
    }

    #[tokio::test]
    async fn test_settle_nothing_to_settle() {
        let chain = chain(5);
        let ledger = ledger_with(&chain, StepPolicy::AllowSkips).await;
        let err = ledger
            .settle(PAYER, |_| async { Ok::<_, ExternalLedgerError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NothingToSettle(_)));
        assert!(ledger.get(PAYER).await.is_some());
    }

    #[tokio::test]
    async fn test_settle_removes_channel_once_confirmed() {
        let chain = chain(5);
        let ledger = ledger_with(&chain, StepPolicy::AllowSkips).await;
        ledger.record_payment(PAYER, chain.token(2).unwrap(), 2).await.unwrap();

        let (settlement, tx) = ledger
            .settle(PAYER, |s| async move {
                assert_eq!(s.tokens_used, 2);
                Ok::<_, ExternalLedgerError>(B256::repeat_byte(0x01))
            })
            .await
            .unwrap();
        assert_eq!(settlement.final_value, chain.token(2).unwrap());
        assert_eq!(settlement.payer, PAYER);
        assert_eq!(tx, B256::repeat_byte(0x01));
        assert!(ledger.get(PAYER).await.is_none());

        let err = ledger
            .settle(PAYER, |_| async { Ok::<_, ExternalLedgerError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::ChannelNotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_settlement_keeps_channel() {
        let chain = chain(5);
        let ledger = ledger_with(&chain, StepPolicy::AllowSkips).await;
        ledger.record_payment(PAYER, chain.token(1).unwrap(), 1).await.unwrap();

        let err = ledger
            .settle(PAYER, |_| async {
                Err::<(), _>(ExternalLedgerError::new("redeemChannel", "reverted"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::ExternalLedger(_)));
        assert_eq!(ledger.pending_settlement(PAYER).await.unwrap().tokens_used, 1);

        // Still payable and settleable afterwards.
        ledger.record_payment(PAYER, chain.token(2).unwrap(), 1).await.unwrap();
        let (settlement, ()) = ledger
            .settle(PAYER, |_| async { Ok::<_, ExternalLedgerError>(()) })
            .await
            .unwrap();
        assert_eq!(settlement.tokens_used, 2);
    }

    #[tokio::test]
    async fn test_reregister_after_settlement() {
        let chain = chain(2);
        let ledger = ledger_with(&chain, StepPolicy::AllowSkips).await;
        ledger.record_payment(PAYER, chain.token(1).unwrap(), 1).await.unwrap();
        ledger
            .settle(PAYER, |_| async { Ok::<_, ExternalLedgerError>(()) })
            .await
            .unwrap();
        let fresh = Channel::open(PAYER, TOKEN, B256::repeat_byte(3), 4);
        assert_eq!(ledger.register(fresh).await, Registration::Registered);
    }

    #[tokio::test]
    async fn test_settled_slots_are_dropped() {
        let chain = chain(3);
        let ledger = ledger_with(&chain, StepPolicy::AllowSkips).await;
        ledger.record_payment(PAYER, chain.token(1).unwrap(), 1).await.unwrap();
        ledger
            .settle(PAYER, |_| async { Ok::<_, ExternalLedgerError>(()) })
            .await
            .unwrap();
        assert!(ledger.channels.is_empty());
    }

    #[tokio::test]
    async fn test_slot_in_use_survives_settlement() {
        let chain = chain(3);
        let ledger = ledger_with(&chain, StepPolicy::AllowSkips).await;
        ledger.record_payment(PAYER, chain.token(1).unwrap(), 1).await.unwrap();

        // A registration that grabbed the slot before settlement finished.
        let held = ledger.slot(PAYER);
        ledger
            .settle(PAYER, |_| async { Ok::<_, ExternalLedgerError>(()) })
            .await
            .unwrap();
        assert_eq!(ledger.channels.len(), 1);

        *held.lock().await = Some(Channel::open(PAYER, TOKEN, B256::repeat_byte(3), 4));
        drop(held);
        assert_eq!(ledger.get(PAYER).await.unwrap().total_tokens, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_disclosures_are_serialized() {
        let chain = chain(5);
        let ledger = Arc::new(ledger_with(&chain, StepPolicy::AllowSkips).await);
        let token = chain.token(1).unwrap();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                tokio::spawn(async move { ledger.record_payment(PAYER, token, 1).await })
            })
            .collect();
        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(ledger.get(PAYER).await.unwrap().tokens_used, 1);
    }

    #[tokio::test]
    async fn test_payers_are_independent() {
        let other = Address::repeat_byte(0xbb);
        let chain_a = chain(3);
        let chain_b = HashChain::generate(&ChainSeed::from_bytes([7; 32]), 3).unwrap();
        let ledger = ledger_with(&chain_a, StepPolicy::AllowSkips).await;
        ledger
            .register(Channel::open(other, TOKEN, chain_b.anchor(), 3))
            .await;

        ledger.record_payment(other, chain_b.token(1).unwrap(), 1).await.unwrap();
        let err = ledger
            .record_payment(PAYER, chain_b.token(1).unwrap(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::InvalidToken { .. }));
        assert_eq!(ledger.get(PAYER).await.unwrap().tokens_used, 0);
    }
}
