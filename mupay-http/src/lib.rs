//! HTTP transport for hash-chain payment channels.
//!
//! # Modules
//!
//! - [`constants`] - Route paths, default URL and request timeouts
//! - [`client`] - [`MerchantClient`], the payer's HTTP client for a merchant

pub mod client;
pub mod constants;

pub use client::{MerchantClient, MerchantClientError, Timeouts};
