//! Runtime helpers for the merchant binary.

mod sig_down;

pub use sig_down::SigDown;
