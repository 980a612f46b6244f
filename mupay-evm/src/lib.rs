#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! EVM escrow contract support for hash-chain payment channels.
//!
//! Implements the [`mupay`] external ledger traits against the `MuPay` escrow
//! contract using alloy.
//!
//! - [`contract`] - `sol!` bindings for the escrow contract and ERC-20
//! - [`escrow`] - [`EvmChannelContract`], confirmed channel transactions
//! - [`watcher`] - [`ChannelWatcher`], polls `ChannelCreated` logs
//! - [`error`] - [`EvmContractError`]
//!
//! # Feature Flags
//!
//! - `telemetry` - Enables tracing instrumentation

pub mod contract;
pub mod error;
pub mod escrow;
pub mod watcher;

pub use error::EvmContractError;
pub use escrow::{EvmChannelContract, connect};
pub use watcher::ChannelWatcher;

/// Awaits a future, optionally instrumenting it with a tracing span.
macro_rules! traced {
    ($fut:expr, $span:expr) => {{
        #[cfg(feature = "telemetry")]
        {
            use tracing::Instrument;
            ::core::future::IntoFuture::into_future($fut).instrument($span).await
        }
        #[cfg(not(feature = "telemetry"))]
        {
            $fut.await
        }
    }};
}
pub(crate) use traced;
