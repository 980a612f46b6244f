//! Channel records and the protocol state machine.

use std::fmt;

use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Merchant-side record of one open channel.
///
/// Created only from the escrow ledger's own open notification, advanced only
/// by verified payments, and dropped only after a confirmed settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    /// The payer that funded the channel.
    pub payer: Address,
    /// Settlement asset; the zero address denotes the native asset.
    pub token: Address,
    /// Chain root escrowed on-chain.
    pub trust_anchor: B256,
    /// Chain length, i.e. the maximum number of payable units.
    pub total_tokens: u64,
    /// Most recently verified chain value.
    pub latest_accepted: B256,
    /// Cumulative units paid so far.
    pub tokens_used: u64,
}

impl Channel {
    /// A freshly opened channel with nothing paid yet.
    #[must_use]
    pub const fn open(payer: Address, token: Address, trust_anchor: B256, total_tokens: u64) -> Self {
        Self {
            payer,
            token,
            trust_anchor,
            total_tokens,
            latest_accepted: trust_anchor,
            tokens_used: 0,
        }
    }

    /// Units that can still be paid on this channel.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.total_tokens.saturating_sub(self.tokens_used)
    }

    /// Whether the whole chain has been disclosed.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.tokens_used >= self.total_tokens
    }

    /// The redemption tuple for the current state.
    #[must_use]
    pub const fn settlement(&self) -> Settlement {
        Settlement {
            payer: self.payer,
            token: self.token,
            final_value: self.latest_accepted,
            tokens_used: self.tokens_used,
        }
    }
}

/// Arguments of the escrow ledger's redemption entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settlement {
    /// The payer whose channel is being redeemed.
    pub payer: Address,
    /// Settlement asset.
    pub token: Address,
    /// Latest accepted chain value.
    pub final_value: B256,
    /// Cumulative units to release to the merchant.
    pub tokens_used: u64,
}

/// Lifecycle of a channel as seen by the protocol handlers.
///
/// ```text
/// Negotiating -> Opening -> Open -> Settling -> Closed
///                            |  \______________
///                            v                 v
///                        Reclaiming ------> Reclaimed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelState {
    /// Terms are being agreed; nothing is on-chain.
    Negotiating,
    /// The open request has been submitted to the escrow ledger.
    Opening,
    /// Funds are escrowed and payments flow.
    Open,
    /// Redemption has been requested.
    Settling,
    /// Redemption confirmed; funds released.
    Closed,
    /// The payer is recovering the escrow unilaterally.
    Reclaiming,
    /// Escrow returned to the payer.
    Reclaimed,
}

impl ChannelState {
    /// Whether `self -> next` is a legal transition.
    ///
    /// `Settling -> Open` and `Reclaiming -> Open` are the retry edges taken
    /// when the escrow ledger rejects the request and the channel is left intact.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Negotiating, Self::Opening)
                | (Self::Opening | Self::Settling | Self::Reclaiming | Self::Open, Self::Open)
                | (Self::Open, Self::Settling)
                | (Self::Settling, Self::Closed)
                | (Self::Open | Self::Settling, Self::Reclaiming)
                | (Self::Reclaiming, Self::Reclaimed)
        )
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Reclaimed)
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidState`] if the transition is not allowed.
    pub fn transition(&mut self, next: Self) -> Result<(), ChannelError> {
        if !self.can_transition_to(next) {
            return Err(ChannelError::InvalidState {
                expected: next.predecessor(),
                actual: *self,
            });
        }
        *self = next;
        Ok(())
    }

    /// The canonical state from which `self` is entered, used for error reporting.
    const fn predecessor(self) -> Self {
        match self {
            Self::Negotiating | Self::Opening => Self::Negotiating,
            Self::Open | Self::Settling | Self::Reclaiming => Self::Open,
            Self::Closed => Self::Settling,
            Self::Reclaimed => Self::Reclaiming,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Negotiating => "negotiating",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Settling => "settling",
            Self::Closed => "closed",
            Self::Reclaiming => "reclaiming",
            Self::Reclaimed => "reclaimed",
        };
        f.write_str(name)
    }
}
