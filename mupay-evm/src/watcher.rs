//! `ChannelCreated` log watcher.
//!
//! Polls the escrow contract for channels opened to one merchant and forwards
//! them as [`ChannelOpened`] notifications into an `mpsc` channel, where the
//! merchant's dispatch loop picks them up. Delivery is at-least-once: a range
//! that fails to load is retried on the next tick, and registration on the
//! receiving side is idempotent.

use std::time::Duration;

use alloy_primitives::Address;
use alloy_provider::Provider;
use alloy_rpc_types_eth::{Filter, Log};
use alloy_sol_types::SolEvent;
use mupay::ChannelOpened;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::contract::IMuPay;
use crate::error::EvmContractError;

/// Default delay between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Largest block range requested in a single `eth_getLogs` call.
pub const MAX_BLOCK_RANGE: u64 = 2_000;

/// Decodes a `ChannelCreated` log.
///
/// Returns `None` for logs of any other shape.
#[must_use]
pub fn decode_channel_created(log: &Log) -> Option<ChannelOpened> {
    let decoded = log.log_decode::<IMuPay::ChannelCreated>().ok()?;
    let event = decoded.inner.data;
    Some(ChannelOpened {
        payer: event.payer,
        merchant: event.merchant,
        token: event.token,
        amount: event.amount,
        chain_length: event.numberOfTokens.saturating_to(),
        block_number: log.block_number,
    })
}

/// Polls `ChannelCreated` logs addressed to one merchant.
#[derive(Debug)]
pub struct ChannelWatcher<P> {
    provider: P,
    contract: Address,
    merchant: Address,
    poll_interval: Duration,
    next_block: Option<u64>,
}

impl<P: Provider> ChannelWatcher<P> {
    /// Watches `contract` for channels opened to `merchant`, starting at the
    /// chain head.
    pub const fn new(provider: P, contract: Address, merchant: Address) -> Self {
        Self {
            provider,
            contract,
            merchant,
            poll_interval: DEFAULT_POLL_INTERVAL,
            next_block: None,
        }
    }

    /// Sets the delay between polls.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Starts from `block` instead of the chain head, to catch up on
    /// channels opened while the merchant was offline.
    #[must_use]
    pub const fn starting_at(mut self, block: u64) -> Self {
        self.next_block = Some(block);
        self
    }

    /// The next block that will be scanned, once known.
    pub const fn next_block(&self) -> Option<u64> {
        self.next_block
    }

    fn filter(&self, from: u64, to: u64) -> Filter {
        Filter::new()
            .address(self.contract)
            .event_signature(IMuPay::ChannelCreated::SIGNATURE_HASH)
            .topic2(self.merchant.into_word())
            .from_block(from)
            .to_block(to)
    }

    /// Fetches channel openings since the last poll.
    ///
    /// # Errors
    ///
    /// Fails if the block number or the logs cannot be fetched; the same
    /// range is retried on the next call.
    pub async fn poll(&mut self) -> Result<Vec<ChannelOpened>, EvmContractError> {
        let head = self.provider.get_block_number().await?;
        let from = *self.next_block.get_or_insert(head);
        if from > head {
            return Ok(Vec::new());
        }
        let to = head.min(from.saturating_add(MAX_BLOCK_RANGE - 1));
        let logs = self.provider.get_logs(&self.filter(from, to)).await?;
        let events: Vec<ChannelOpened> = logs
            .iter()
            .filter_map(decode_channel_created)
            .filter(|event| event.merchant == self.merchant)
            .collect();
        self.next_block = Some(to + 1);
        #[cfg(feature = "telemetry")]
        if !events.is_empty() {
            tracing::debug!(from, to, count = events.len(), "Fetched ChannelCreated logs");
        }
        Ok(events)
    }

    /// Polls until `cancel` fires or the receiving side is dropped.
    pub async fn run(mut self, sender: mpsc::Sender<ChannelOpened>, cancel: CancellationToken) {
        #[cfg(feature = "telemetry")]
        tracing::info!(
            contract = %self.contract,
            merchant = %self.merchant,
            "Watching for ChannelCreated events"
        );
        loop {
            match self.poll().await {
                Ok(events) => {
                    for event in events {
                        #[cfg(feature = "telemetry")]
                        tracing::info!(
                            payer = %event.payer,
                            token = %event.token,
                            amount = %event.amount,
                            total_tokens = event.chain_length,
                            "New channel detected"
                        );
                        if sender.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Err(_err) => {
                    #[cfg(feature = "telemetry")]
                    tracing::warn!(error = %_err, "Failed to poll ChannelCreated logs");
                }
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        #[cfg(feature = "telemetry")]
        tracing::info!("Channel watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{B256, U64, U256};
    use alloy_provider::ProviderBuilder;
    use alloy_transport::mock::Asserter;

    use super::*;

    const ESCROW: Address = Address::repeat_byte(0xec);
    const PAYER: Address = Address::repeat_byte(0xaa);
    const MERCHANT: Address = Address::repeat_byte(0x3e);

    fn created_log(merchant: Address, block: u64) -> Log {
        let event = IMuPay::ChannelCreated {
            payer: PAYER,
            merchant,
            token: Address::ZERO,
            amount: U256::from(100_000_u64),
            numberOfTokens: U256::from(100_u64),
            merchantWithdrawAfterBlocks: U256::from(10_u64),
        };
        Log {
            inner: alloy_primitives::Log {
                address: ESCROW,
                data: event.encode_log_data(),
            },
            block_number: Some(block),
            ..Log::default()
        }
    }

    #[test]
    fn test_decode_channel_created() {
        let event = decode_channel_created(&created_log(MERCHANT, 7)).unwrap();
        assert_eq!(event.payer, PAYER);
        assert_eq!(event.merchant, MERCHANT);
        assert_eq!(event.token, Address::ZERO);
        assert_eq!(event.chain_length, 100);
        assert_eq!(event.block_number, Some(7));
    }

    #[test]
    fn test_decode_ignores_foreign_logs() {
        let log = Log {
            inner: alloy_primitives::Log::new_unchecked(
                ESCROW,
                vec![B256::repeat_byte(0x01)],
                alloy_primitives::Bytes::new(),
            ),
            ..Log::default()
        };
        assert!(decode_channel_created(&log).is_none());
    }

    #[tokio::test]
    async fn test_poll_advances_past_scanned_range() {
        let asserter = Asserter::new();
        let provider = ProviderBuilder::new().connect_mocked_client(asserter.clone());
        let mut watcher = ChannelWatcher::new(provider, ESCROW, MERCHANT).starting_at(5);

        asserter.push_success(&U64::from(9_u64));
        asserter.push_success(&vec![
            created_log(MERCHANT, 6),
            created_log(Address::repeat_byte(0x01), 8),
        ]);
        let events = watcher.poll().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].block_number, Some(6));
        assert_eq!(watcher.next_block(), Some(10));

        // Nothing new at the same head.
        asserter.push_success(&U64::from(9_u64));
        assert!(watcher.poll().await.unwrap().is_empty());
        assert_eq!(watcher.next_block(), Some(10));
    }

    #[tokio::test]
    async fn test_failed_poll_retries_same_range() {
        let asserter = Asserter::new();
        let provider = ProviderBuilder::new().connect_mocked_client(asserter.clone());
        let mut watcher = ChannelWatcher::new(provider, ESCROW, MERCHANT).starting_at(3);

        asserter.push_success(&U64::from(4_u64));
        asserter.push_failure_msg("rate limited");
        assert!(watcher.poll().await.is_err());
        assert_eq!(watcher.next_block(), Some(3));
    }

    #[tokio::test]
    async fn test_run_forwards_and_stops_on_cancel() {
        let asserter = Asserter::new();
        let provider = ProviderBuilder::new().connect_mocked_client(asserter.clone());
        let watcher = ChannelWatcher::new(provider, ESCROW, MERCHANT)
            .starting_at(1)
            .with_poll_interval(Duration::from_millis(10));
        asserter.push_success(&U64::from(2_u64));
        asserter.push_success(&vec![created_log(MERCHANT, 2)]);

        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(watcher.run(tx, cancel.clone()));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.payer, PAYER);
        cancel.cancel();
        task.await.unwrap();
    }
}
