//! Payer-side hash chain generation.
//!
//! A chain of length `N` holds `N + 1` values `v[0..=N]` linked by
//! `v[i] = H(v[i + 1])`, where `H` is Keccak-256. `v[N]` is the seed itself and
//! `v[0] = H^N(seed)` is the trust anchor escrowed on-chain.
//!
//! Paying for `k` cumulative units discloses `v[k]`: it is exactly `k` hash
//! applications away from the anchor, and exactly `k - j` applications away
//! from any previously disclosed `v[j]`. The seed-side end of the chain is
//! therefore only revealed once the whole chain has been spent.

use std::fmt;

use alloy_primitives::{B256, keccak256};
use rand::RngExt;
use rand::rng;

use crate::error::ChannelError;

/// Largest supported chain length.
///
/// Bounded by the `uint16 numberOfTokens` field of the escrow contract.
pub const MAX_CHAIN_LENGTH: u64 = 65_535;

/// The one-way function linking consecutive chain values.
#[must_use]
pub fn hash(value: &B256) -> B256 {
    keccak256(value)
}

/// Secret 32-byte seed from which a chain is derived.
///
/// Never leaves the payer. `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct ChainSeed([u8; 32]);

impl ChainSeed {
    /// Draws a fresh seed from the thread-local CSPRNG.
    #[must_use]
    pub fn random() -> Self {
        let bytes: [u8; 32] = rng().random();
        Self(bytes)
    }

    /// Wraps caller-supplied seed bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The chain's deepest value, `v[N]`.
    fn derive(&self) -> B256 {
        B256::from(self.0)
    }
}

impl fmt::Debug for ChainSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChainSeed(..)")
    }
}

/// An immutable, fully materialized hash chain.
#[derive(Clone, PartialEq, Eq)]
pub struct HashChain {
    /// `values[i] == v[i]`; `values[0]` is the anchor.
    values: Vec<B256>,
}

impl fmt::Debug for HashChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashChain")
            .field("anchor", &self.anchor())
            .field("length", &self.length())
            .finish_non_exhaustive()
    }
}

impl HashChain {
    /// Generates a chain of `length` links from `seed`.
    ///
    /// Deterministic for a given seed.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidConfiguration`] if `length` is zero or
    /// larger than [`MAX_CHAIN_LENGTH`].
    pub fn generate(seed: &ChainSeed, length: u64) -> Result<Self, ChannelError> {
        if length == 0 || length > MAX_CHAIN_LENGTH {
            return Err(ChannelError::InvalidConfiguration(format!(
                "hashchain length must be between 1 and {MAX_CHAIN_LENGTH}, got {length}"
            )));
        }
        let count = usize::try_from(length + 1).map_err(|_| {
            ChannelError::InvalidConfiguration(format!("hashchain length {length} overflows"))
        })?;
        let mut values = Vec::with_capacity(count);
        let mut current = seed.derive();
        values.push(current);
        for _ in 0..length {
            current = hash(&current);
            values.push(current);
        }
        values.reverse();
        Ok(Self { values })
    }

    /// The trust anchor `v[0]`, published on-chain when the channel opens.
    #[must_use]
    pub fn anchor(&self) -> B256 {
        self.values[0]
    }

    /// Number of payable units `N`.
    #[must_use]
    pub fn length(&self) -> u64 {
        (self.values.len() - 1) as u64
    }

    /// Returns `v[index]`, or `None` past the end of the chain.
    #[must_use]
    pub fn get(&self, index: u64) -> Option<B256> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.values.get(i))
            .copied()
    }

    /// The value to disclose after `units_paid` cumulative units.
    ///
    /// Returns `None` for zero or for more units than the chain holds.
    #[must_use]
    pub fn token(&self, units_paid: u64) -> Option<B256> {
        if units_paid == 0 {
            return None;
        }
        self.get(units_paid)
    }

    /// All chain values, anchor first.
    #[must_use]
    pub fn values(&self) -> &[B256] {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(byte: u8) -> ChainSeed {
        ChainSeed::from_bytes([byte; 32])
    }

    #[test]
    fn test_generate_links_every_value() {
        for length in [1_u64, 2, 5, 64] {
            let chain = HashChain::generate(&seed(7), length).unwrap();
            assert_eq!(chain.values().len() as u64, length + 1);
            for pair in chain.values().windows(2) {
                assert_eq!(hash(&pair[1]), pair[0]);
            }
        }
    }

    #[test]
    fn test_generate_is_deterministic() {
        let a = HashChain::generate(&seed(1), 10).unwrap();
        let b = HashChain::generate(&seed(1), 10).unwrap();
        let c = HashChain::generate(&seed(2), 10).unwrap();
        assert_eq!(a, b);
        assert_ne!(a.anchor(), c.anchor());
    }

    #[test]
    fn test_deepest_value_is_seed() {
        let chain = HashChain::generate(&seed(9), 3).unwrap();
        assert_eq!(chain.get(3), Some(B256::from([9_u8; 32])));
        assert_eq!(chain.get(4), None);
    }

    #[test]
    fn test_anchor_is_n_hashes_of_seed() {
        let chain = HashChain::generate(&seed(3), 4).unwrap();
        let mut value = B256::from([3_u8; 32]);
        for _ in 0..4 {
            value = hash(&value);
        }
        assert_eq!(chain.anchor(), value);
    }

    #[test]
    fn test_generate_rejects_invalid_length() {
        assert!(matches!(
            HashChain::generate(&seed(0), 0),
            Err(ChannelError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            HashChain::generate(&seed(0), MAX_CHAIN_LENGTH + 1),
            Err(ChannelError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_token_bounds() {
        let chain = HashChain::generate(&seed(5), 5).unwrap();
        assert_eq!(chain.token(0), None);
        assert_eq!(chain.token(1), chain.get(1));
        assert_eq!(chain.token(5), chain.get(5));
        assert_eq!(chain.token(6), None);
    }

    #[test]
    fn test_seed_debug_is_redacted() {
        assert_eq!(format!("{:?}", seed(0xaa)), "ChainSeed(..)");
        let random = ChainSeed::random();
        assert_ne!(random, ChainSeed::random());
    }
}
