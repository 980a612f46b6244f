//! Merchant-side protocol handler.
//!
//! [`Merchant`] answers negotiation, verifies payments against the
//! [`ChannelLedger`], settles channels on the escrow ledger, and registers
//! channels from the escrow ledger's open notifications.
//!
//! Notifications are consumed by [`Merchant::run_dispatch`], a loop fed by an
//! `mpsc` channel that is independent of request handling. A notification
//! whose escrow record cannot be read yet is retried with exponential backoff
//! before it is dropped. The ledger is injected, so tests drive the handler
//! against an in-memory escrow.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, Settlement};
use crate::contract::{ChannelContract, ChannelOpened, Confirmation};
use crate::error::ChannelError;
use crate::ledger::{ChannelLedger, Registration};
use crate::proto::{NegotiateRequest, NegotiateResponse, PaymentRequest, PaymentResponse};

/// A confirmed channel redemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redemption {
    /// What was redeemed.
    pub settlement: Settlement,
    /// The confirmed redemption transaction.
    pub confirmation: Confirmation,
}

/// Backoff schedule for registrations whose escrow record is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationRetry {
    /// Total attempts per notification, including the first.
    pub attempts: u32,
    /// Delay before the second attempt; doubled after each failure.
    pub initial_backoff: Duration,
    /// Upper bound on a single delay.
    pub max_backoff: Duration,
}

impl RegistrationRetry {
    /// Six attempts over roughly fifteen seconds.
    pub const DEFAULT: Self = Self {
        attempts: 6,
        initial_backoff: Duration::from_millis(500),
        max_backoff: Duration::from_secs(8),
    };
}

impl Default for RegistrationRetry {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Merchant-side protocol handler.
#[derive(Debug)]
pub struct Merchant<C> {
    address: Address,
    contract: C,
    ledger: Arc<ChannelLedger>,
    retry: RegistrationRetry,
}

impl<C: ChannelContract> Merchant<C> {
    /// Creates a handler settling to `address` through `contract`.
    pub const fn new(address: Address, contract: C, ledger: Arc<ChannelLedger>) -> Self {
        Self {
            address,
            contract,
            ledger,
            retry: RegistrationRetry::DEFAULT,
        }
    }

    /// Sets the backoff used by [`Merchant::run_dispatch`].
    #[must_use]
    pub fn with_registration_retry(mut self, retry: RegistrationRetry) -> Self {
        self.retry = retry;
        self
    }

    /// The merchant's settlement address.
    pub const fn address(&self) -> Address {
        self.address
    }

    /// The channel ledger.
    pub fn ledger(&self) -> &ChannelLedger {
        &self.ledger
    }

    /// Accepts proposed channel terms.
    ///
    /// Nothing is committed here; the channel only becomes payable once the
    /// escrow ledger reports it open.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidConfiguration`] for a zero amount.
    pub fn negotiate(&self, request: &NegotiateRequest) -> Result<NegotiateResponse, ChannelError> {
        if request.amount == U256::ZERO {
            return Err(ChannelError::InvalidConfiguration(
                "channel amount must be positive".into(),
            ));
        }
        #[cfg(feature = "telemetry")]
        tracing::info!(
            payer = %request.payer,
            contract = %request.contract,
            token = %request.token,
            amount = %request.amount,
            "Negotiation request"
        );
        Ok(NegotiateResponse {
            message: "Terms accepted.".into(),
            merchant_address: self.address,
        })
    }

    /// Registers the channel announced by `event`.
    ///
    /// Events for other merchants are ignored with `Ok(None)`. The trust
    /// anchor and chain length are read back from the escrow ledger rather
    /// than taken from the event.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::DuplicateChannel`] if the payer already has a channel
    /// - [`ChannelError::ChannelNotFound`] if the escrow ledger has no record
    /// - [`ChannelError::InvalidConfiguration`] if the record has no units
    /// - [`ChannelError::ExternalLedger`] if the record cannot be read
    pub async fn on_channel_opened(
        &self,
        event: &ChannelOpened,
    ) -> Result<Option<Channel>, ChannelError> {
        if event.merchant != self.address {
            return Ok(None);
        }
        let payer = event.payer;
        if self.ledger.get(payer).await.is_some() {
            return Err(ChannelError::DuplicateChannel(payer));
        }

        let record = self
            .contract
            .channel(payer, self.address, event.token)
            .await?
            .ok_or(ChannelError::ChannelNotFound(payer))?;
        if record.chain_length == 0 {
            return Err(ChannelError::InvalidConfiguration(format!(
                "channel for payer {payer} has no tokens"
            )));
        }
        #[cfg(feature = "telemetry")]
        if record.chain_length != event.chain_length {
            tracing::warn!(
                payer = %payer,
                announced = event.chain_length,
                recorded = record.chain_length,
                "Channel length differs from notification, using recorded value"
            );
        }

        let channel = Channel::open(payer, event.token, record.trust_anchor, record.chain_length);
        match self.ledger.register(channel.clone()).await {
            Registration::Registered => Ok(Some(channel)),
            Registration::Duplicate => Err(ChannelError::DuplicateChannel(payer)),
        }
    }

    /// Verifies a disclosed chain value and credits the payer's channel.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::ChannelNotFound`] if the payer has no open channel
    /// - [`ChannelError::InvalidToken`] if the disclosure is rejected
    pub async fn accept_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentResponse, ChannelError> {
        let tokens_used = self
            .ledger
            .record_payment(request.payer_address, request.preimage, request.tokens_used)
            .await?;
        Ok(PaymentResponse {
            message: "Payment received and validated.".into(),
            total_tokens_used: Some(tokens_used),
        })
    }

    /// Redeems the payer's channel on the escrow ledger.
    ///
    /// The channel is dropped from the ledger only after the redemption is
    /// confirmed; on failure it stays open and the call can be retried.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::ChannelNotFound`] if the payer has no open channel
    /// - [`ChannelError::NothingToSettle`] if nothing has been paid
    /// - [`ChannelError::ExternalLedger`] if the redemption fails
    pub async fn redeem(&self, payer: Address) -> Result<Redemption, ChannelError> {
        let contract = &self.contract;
        let result = self
            .ledger
            .settle(payer, |settlement| async move {
                #[cfg(feature = "telemetry")]
                tracing::info!(
                    payer = %settlement.payer,
                    final_value = %settlement.final_value,
                    tokens_used = settlement.tokens_used,
                    "Redeeming channel"
                );
                contract.redeem_channel(&settlement).await
            })
            .await;
        match result {
            Ok((settlement, confirmation)) => {
                #[cfg(feature = "telemetry")]
                tracing::info!(payer = %payer, tx = %confirmation.tx_hash, "Channel redeemed");
                Ok(Redemption {
                    settlement,
                    confirmation,
                })
            }
            Err(err) => {
                #[cfg(feature = "telemetry")]
                tracing::warn!(payer = %payer, error = %err, "Redemption failed");
                Err(err)
            }
        }
    }

    /// Consumes open notifications until `events` closes or `cancel` fires.
    ///
    /// Duplicates are logged and skipped. A notification whose escrow record
    /// cannot be read (an RPC error, or a node that has not seen the block
    /// yet) is retried per [`RegistrationRetry`]. Other failures are logged
    /// and do not stop the loop.
    pub async fn run_dispatch(
        &self,
        mut events: mpsc::Receiver<ChannelOpened>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match self.register_with_retry(&event, &cancel).await {
                Ok(Some(_channel)) => {}
                Ok(None) => {
                    #[cfg(feature = "telemetry")]
                    tracing::trace!(merchant = %event.merchant, "Ignoring channel for another merchant");
                }
                Err(ChannelError::DuplicateChannel(_payer)) => {
                    #[cfg(feature = "telemetry")]
                    tracing::warn!(payer = %_payer, "Channel already exists, skipping");
                }
                Err(_err) => {
                    #[cfg(feature = "telemetry")]
                    tracing::error!(payer = %event.payer, error = %_err, "Failed to register channel");
                }
            }
        }
        #[cfg(feature = "telemetry")]
        tracing::info!("Channel notification dispatch stopped");
    }

    async fn register_with_retry(
        &self,
        event: &ChannelOpened,
        cancel: &CancellationToken,
    ) -> Result<Option<Channel>, ChannelError> {
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 1;
        loop {
            match self.on_channel_opened(event).await {
                Err(err) if is_transient(&err) && attempt < self.retry.attempts => {
                    #[cfg(feature = "telemetry")]
                    tracing::warn!(
                        payer = %event.payer,
                        attempt,
                        retry_in_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Channel record unavailable, retrying registration"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Err(err),
                        () = tokio::time::sleep(backoff) => {}
                    }
                    backoff = backoff.saturating_mul(2).min(self.retry.max_backoff);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

/// Failures that may clear once the escrow ledger catches up.
const fn is_transient(err: &ChannelError) -> bool {
    matches!(
        err,
        ChannelError::ExternalLedger(_) | ChannelError::ChannelNotFound(_)
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use alloy_primitives::B256;

    use super::*;
    use crate::contract::fake::FakeEscrow;
    use crate::contract::{ChannelContract, OpenChannelParams};
    use crate::error::InvalidTokenReason;
    use crate::hashchain::{ChainSeed, HashChain};

    const MERCHANT: Address = Address::repeat_byte(0x3e);
    const PAYER: Address = Address::repeat_byte(0xaa);
    const TOKEN: Address = Address::repeat_byte(0x70);

    struct Fixture {
        escrow: Arc<FakeEscrow>,
        merchant: Merchant<Arc<FakeEscrow>>,
        chain: HashChain,
    }

    async fn fixture(length: u64) -> Fixture {
        let escrow = Arc::new(FakeEscrow::new(PAYER));
        let chain = HashChain::generate(&ChainSeed::from_bytes([0x5a; 32]), length).unwrap();
        escrow
            .open_channel(&OpenChannelParams {
                merchant: MERCHANT,
                token: Address::ZERO,
                trust_anchor: chain.anchor(),
                amount: U256::from(1_000_u64),
                chain_length: length,
                merchant_withdraw_after_blocks: 10,
                payer_withdraw_after_blocks: 20,
            })
            .await
            .unwrap();
        let merchant = Merchant::new(
            MERCHANT,
            Arc::clone(&escrow),
            Arc::new(ChannelLedger::new()),
        );
        Fixture {
            escrow,
            merchant,
            chain,
        }
    }

    fn opened(merchant: Address, chain_length: u64) -> ChannelOpened {
        ChannelOpened {
            payer: PAYER,
            merchant,
            token: Address::ZERO,
            amount: U256::from(1_000_u64),
            chain_length,
            block_number: Some(1),
        }
    }

    fn payment(preimage: B256, steps: u64) -> PaymentRequest {
        PaymentRequest {
            payer_address: PAYER,
            preimage,
            tokens_used: steps,
        }
    }

    #[test]
    fn test_negotiate_returns_merchant_address() {
        let merchant = Merchant::new(MERCHANT, FakeEscrow::new(PAYER), Arc::default());
        let request = NegotiateRequest {
            payer: PAYER,
            contract: Address::repeat_byte(0xec),
            token: TOKEN,
            amount: U256::from(100_u64),
        };
        let response = merchant.negotiate(&request).unwrap();
        assert_eq!(response.merchant_address, MERCHANT);

        let zero = NegotiateRequest {
            amount: U256::ZERO,
            ..request
        };
        assert!(matches!(
            merchant.negotiate(&zero),
            Err(ChannelError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_registration_uses_recorded_anchor() {
        let f = fixture(5).await;
        // The notification's length is a hint only.
        let channel = f
            .merchant
            .on_channel_opened(&opened(MERCHANT, 99))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(channel.trust_anchor, f.chain.anchor());
        assert_eq!(channel.latest_accepted, f.chain.anchor());
        assert_eq!(channel.total_tokens, 5);
    }

    #[tokio::test]
    async fn test_foreign_merchant_events_are_ignored() {
        let f = fixture(5).await;
        let result = f
            .merchant
            .on_channel_opened(&opened(Address::repeat_byte(0x01), 5))
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(f.merchant.ledger().get(PAYER).await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_notification_registers_once() {
        let f = fixture(5).await;
        f.merchant.on_channel_opened(&opened(MERCHANT, 5)).await.unwrap();
        f.merchant
            .accept_payment(&payment(f.chain.token(1).unwrap(), 1))
            .await
            .unwrap();

        let err = f
            .merchant
            .on_channel_opened(&opened(MERCHANT, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::DuplicateChannel(p) if p == PAYER));
        assert_eq!(f.merchant.ledger().snapshot().await.len(), 1);
        assert_eq!(f.merchant.ledger().get(PAYER).await.unwrap().tokens_used, 1);
    }

    #[tokio::test]
    async fn test_notification_without_record_is_rejected() {
        let merchant = Merchant::new(MERCHANT, FakeEscrow::new(PAYER), Arc::default());
        let err = merchant
            .on_channel_opened(&opened(MERCHANT, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::ChannelNotFound(_)));
        assert!(merchant.ledger().get(PAYER).await.is_none());
    }

    #[tokio::test]
    async fn test_payment_before_open_is_not_found() {
        let f = fixture(5).await;
        let err = f
            .merchant
            .accept_payment(&payment(f.chain.token(1).unwrap(), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::ChannelNotFound(_)));
    }

    #[tokio::test]
    async fn test_pay_and_redeem() {
        let f = fixture(5).await;
        f.merchant.on_channel_opened(&opened(MERCHANT, 5)).await.unwrap();

        let response = f
            .merchant
            .accept_payment(&payment(f.chain.token(2).unwrap(), 2))
            .await
            .unwrap();
        assert_eq!(response.total_tokens_used, Some(2));

        let redemption = f.merchant.redeem(PAYER).await.unwrap();
        assert_eq!(redemption.settlement.tokens_used, 2);
        assert_eq!(redemption.settlement.final_value, f.chain.token(2).unwrap());
        assert_eq!(f.escrow.redeemed.lock().unwrap().len(), 1);

        assert!(matches!(
            f.merchant.redeem(PAYER).await,
            Err(ChannelError::ChannelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_redeem_with_nothing_paid() {
        let f = fixture(5).await;
        f.merchant.on_channel_opened(&opened(MERCHANT, 5)).await.unwrap();
        assert!(matches!(
            f.merchant.redeem(PAYER).await,
            Err(ChannelError::NothingToSettle(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_redemption_is_retryable() {
        let f = fixture(5).await;
        f.merchant.on_channel_opened(&opened(MERCHANT, 5)).await.unwrap();
        f.merchant
            .accept_payment(&payment(f.chain.token(1).unwrap(), 1))
            .await
            .unwrap();

        f.escrow.fail_redeem.store(true, Ordering::SeqCst);
        let err = f.merchant.redeem(PAYER).await.unwrap_err();
        assert!(matches!(err, ChannelError::ExternalLedger(_)));
        assert_eq!(f.merchant.ledger().get(PAYER).await.unwrap().tokens_used, 1);

        // Payments keep flowing while redemption is pending a retry.
        f.merchant
            .accept_payment(&payment(f.chain.token(2).unwrap(), 1))
            .await
            .unwrap();

        f.escrow.fail_redeem.store(false, Ordering::SeqCst);
        let redemption = f.merchant.redeem(PAYER).await.unwrap();
        assert_eq!(redemption.settlement.tokens_used, 2);
    }

    #[tokio::test]
    async fn test_replayed_disclosure_is_invalid_token() {
        let f = fixture(5).await;
        f.merchant.on_channel_opened(&opened(MERCHANT, 5)).await.unwrap();
        let first = f.chain.token(1).unwrap();
        f.merchant.accept_payment(&payment(first, 1)).await.unwrap();
        let err = f.merchant.accept_payment(&payment(first, 1)).await.unwrap_err();
        assert!(matches!(
            err,
            ChannelError::InvalidToken {
                reason: InvalidTokenReason::HashMismatch,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_dispatch_registers_and_stops_on_cancel() {
        let f = fixture(5).await;
        let merchant = Arc::new(f.merchant);
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let merchant = Arc::clone(&merchant);
            let cancel = cancel.clone();
            async move { merchant.run_dispatch(rx, cancel).await }
        });

        tx.send(opened(Address::repeat_byte(0x01), 5)).await.unwrap();
        tx.send(opened(MERCHANT, 5)).await.unwrap();
        tx.send(opened(MERCHANT, 5)).await.unwrap();

        // Wait until the dispatch loop has drained the queue.
        while tx.capacity() < tx.max_capacity() {
            tokio::task::yield_now().await;
        }
        for _ in 0..100 {
            if merchant.ledger().get(PAYER).await.is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(merchant.ledger().snapshot().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_retries_unreadable_record() {
        let f = fixture(5).await;
        f.escrow.failing_lookups.store(2, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(1);
        tx.send(opened(MERCHANT, 5)).await.unwrap();
        drop(tx);

        f.merchant.run_dispatch(rx, CancellationToken::new()).await;
        assert_eq!(f.escrow.lookups.load(Ordering::SeqCst), 3);

        let response = f
            .merchant
            .accept_payment(&payment(f.chain.token(1).unwrap(), 1))
            .await
            .unwrap();
        assert_eq!(response.total_tokens_used, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_gives_up_after_bounded_attempts() {
        let f = fixture(5).await;
        f.escrow.failing_lookups.store(u64::MAX, Ordering::SeqCst);
        let merchant = f.merchant.with_registration_retry(RegistrationRetry {
            attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(150),
        });
        let (tx, rx) = mpsc::channel(1);
        tx.send(opened(MERCHANT, 5)).await.unwrap();
        drop(tx);

        let started = tokio::time::Instant::now();
        merchant.run_dispatch(rx, CancellationToken::new()).await;
        assert_eq!(f.escrow.lookups.load(Ordering::SeqCst), 3);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(250) && waited < Duration::from_secs(1));
        assert!(merchant.ledger().get(PAYER).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_retries_record_not_yet_visible() {
        let escrow = Arc::new(FakeEscrow::new(PAYER));
        let merchant = Merchant::new(MERCHANT, Arc::clone(&escrow), Arc::default());
        let chain = HashChain::generate(&ChainSeed::from_bytes([0x5a; 32]), 5).unwrap();
        let (tx, rx) = mpsc::channel(1);
        tx.send(opened(MERCHANT, 5)).await.unwrap();
        drop(tx);

        // The record lands between the first and second lookup.
        let dispatch = merchant.run_dispatch(rx, CancellationToken::new());
        let open = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            escrow
                .open_channel(&OpenChannelParams {
                    merchant: MERCHANT,
                    token: Address::ZERO,
                    trust_anchor: chain.anchor(),
                    amount: U256::from(1_000_u64),
                    chain_length: 5,
                    merchant_withdraw_after_blocks: 10,
                    payer_withdraw_after_blocks: 20,
                })
                .await
                .unwrap();
        };
        tokio::join!(dispatch, open);

        assert_eq!(escrow.lookups.load(Ordering::SeqCst), 2);
        assert_eq!(
            merchant.ledger().get(PAYER).await.unwrap().trust_anchor,
            chain.anchor()
        );
    }

    #[tokio::test]
    async fn test_dispatch_stops_when_source_closes() {
        let merchant = Merchant::new(MERCHANT, FakeEscrow::new(PAYER), Arc::default());
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        merchant.run_dispatch(rx, CancellationToken::new()).await;
    }
}
