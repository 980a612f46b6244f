//! The disclosure verification rule.
//!
//! Pure and side-effect free: budget and step-count policy belong to the
//! [`ledger`](crate::ledger), this module only checks the hash relation.

use alloy_primitives::B256;

use crate::hashchain::hash;

/// Applies the chain hash `steps` times to `value`.
#[must_use]
pub fn hash_steps(value: &B256, steps: u64) -> B256 {
    let mut current = *value;
    for _ in 0..steps {
        current = hash(&current);
    }
    current
}

/// Returns `true` iff hashing `disclosed` exactly `steps` times yields `accepted`.
#[must_use]
pub fn verify(accepted: &B256, disclosed: &B256, steps: u64) -> bool {
    hash_steps(disclosed, steps) == *accepted
}
