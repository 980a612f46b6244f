#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Core types for hash-chain micropayment channels.
//!
//! A payer commits to a chain of `N` Keccak-256 values whose root (the *trust
//! anchor*) is escrowed on-chain together with the channel funds. Each unit of
//! a metered resource is then paid for off-chain by disclosing the next chain
//! preimage. The merchant checks every disclosure locally and redeems the
//! accumulated total in a single on-chain transaction.
//!
//! # Modules
//!
//! - [`hashchain`] - Chain generation from a random seed
//! - [`verify`] - The pure disclosure verification rule
//! - [`channel`] - Channel records and the protocol state machine
//! - [`ledger`] - Merchant-side channel ledger with per-payer serialization
//! - [`contract`] - Interfaces of the external escrow ledger
//! - [`proto`] - Payer/merchant wire messages
//! - [`merchant`] - Merchant-side protocol handler and notification dispatch
//! - [`payer`] - Payer-side protocol handler
//! - [`error`] - Error types shared by all of the above
//!
//! # Feature Flags
//!
//! - `telemetry` - Enables tracing instrumentation

pub mod channel;
pub mod contract;
pub mod error;
pub mod hashchain;
pub mod ledger;
pub mod merchant;
pub mod payer;
pub mod proto;
pub mod verify;

pub use channel::{Channel, ChannelState, Settlement};
pub use contract::{
    AssetAllowance, ChannelContract, ChannelOpened, Confirmation, OnchainChannel, OpenChannelParams,
};
pub use error::{ChannelError, ExternalLedgerError, InvalidTokenReason, TransportError};
pub use hashchain::{ChainSeed, HashChain};
pub use ledger::{ChannelLedger, Registration, StepPolicy};
pub use merchant::{Merchant, Redemption, RegistrationRetry};
pub use payer::{MerchantTransport, PayLoop, Payer, PayerConfig};
