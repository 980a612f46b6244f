//! Error types for the hash-chain payment channel protocol.

use std::fmt;

use alloy_primitives::{Address, B256};

use crate::channel::ChannelState;

/// Errors surfaced by the channel ledger and the protocol handlers.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Bad chain length, missing terms or otherwise unusable configuration.
    ///
    /// Fatal at startup; never produced mid-protocol.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// No open channel is tracked for the payer.
    #[error("no active channel found for payer {0}")]
    ChannelNotFound(Address),

    /// A channel for the payer is already tracked.
    #[error("channel for payer {0} already exists")]
    DuplicateChannel(Address),

    /// The disclosed chain value was rejected.
    #[error("invalid token for payer {payer}: {reason}")]
    InvalidToken {
        /// The payer whose disclosure was rejected.
        payer: Address,
        /// Why the disclosure was rejected.
        reason: InvalidTokenReason,
    },

    /// Settlement requested on a channel with no accepted payments.
    #[error("no payments have been made on the channel for payer {0}")]
    NothingToSettle(Address),

    /// A protocol step was attempted from the wrong state.
    #[error("invalid channel state: expected {expected}, found {actual}")]
    InvalidState {
        /// The state the step requires.
        expected: ChannelState,
        /// The state the session is actually in.
        actual: ChannelState,
    },

    /// Submission to, or confirmation by, the external ledger failed.
    #[error(transparent)]
    ExternalLedger(#[from] ExternalLedgerError),

    /// The payer/merchant message exchange failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Reason a disclosed chain value was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidTokenReason {
    /// The claimed step count was zero.
    ZeroSteps,
    /// The claimed step count exceeds what is left of the chain.
    ExceedsBudget {
        /// Claimed steps.
        requested: u64,
        /// `total_tokens - tokens_used` at the time of the claim.
        remaining: u64,
    },
    /// The ledger only accepts single-step disclosures.
    SkipNotAllowed {
        /// Claimed steps.
        requested: u64,
    },
    /// Hashing the disclosed value did not reproduce the latest accepted value.
    HashMismatch,
}

impl fmt::Display for InvalidTokenReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroSteps => write!(f, "step count must be positive"),
            Self::ExceedsBudget {
                requested,
                remaining,
            } => write!(
                f,
                "claimed {requested} steps but only {remaining} remain on the channel"
            ),
            Self::SkipNotAllowed { requested } => {
                write!(f, "claimed {requested} steps but only single steps are accepted")
            }
            Self::HashMismatch => write!(f, "hashchain verification failed"),
        }
    }
}

/// Failure reported by the external escrow ledger.
///
/// Channel state is left untouched when this is returned, so the operation
/// can be retried or the payer can fall back to reclaiming.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed: {message}")]
pub struct ExternalLedgerError {
    /// The ledger entry point that failed (e.g. `redeemChannel`).
    pub operation: &'static str,
    /// Human-readable failure detail.
    pub message: String,
    /// Hash of the submitted transaction, if it got that far.
    pub tx_hash: Option<B256>,
}

impl ExternalLedgerError {
    /// Creates a new external ledger error.
    #[must_use]
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
            tx_hash: None,
        }
    }

    /// Sets the transaction hash.
    #[must_use]
    pub const fn with_tx_hash(mut self, tx_hash: B256) -> Self {
        self.tx_hash = Some(tx_hash);
        self
    }
}

/// Failure of a payer/merchant message exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{context}: {message}")]
pub struct TransportError {
    /// The exchange that failed (e.g. `POST /payment`).
    pub context: &'static str,
    /// Human-readable failure detail.
    pub message: String,
    /// HTTP status returned by the counterparty, if any.
    pub status: Option<u16>,
}

impl TransportError {
    /// Creates a new transport error.
    #[must_use]
    pub fn new(context: &'static str, message: impl Into<String>) -> Self {
        Self {
            context,
            message: message.into(),
            status: None,
        }
    }

    /// Sets the HTTP status code.
    #[must_use]
    pub const fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}
