//! Merchant agent for hash-chain payment channels.
//!
//! Serves the metered resource, verifies payments against each payer's hash
//! chain and redeems channels on the escrow contract.
//!
//! # Modules
//!
//! - [`handlers`] — Axum route handlers and router builder
//! - [`error`] — HTTP error mapping
//! - [`config`] — Server configuration with environment variable expansion
//! - [`resource`] — The metered resource behind `/data`
//! - [`util`] — Shutdown signal handling

pub mod config;
pub mod error;
pub mod handlers;
pub mod resource;
pub mod util;

pub use handlers::{AppState, MerchantState, merchant_router};
