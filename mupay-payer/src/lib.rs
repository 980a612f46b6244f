//! Payer agent for hash-chain payment channels.
//!
//! # Modules
//!
//! - [`cli`] — Command-line arguments with environment fallbacks
//! - [`session`] — A complete session against a remote merchant

pub mod cli;
pub mod session;

pub use session::{Outcome, SessionOptions, SessionReport, run_session};
