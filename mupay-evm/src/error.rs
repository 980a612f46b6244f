//! Error types for escrow contract calls.

use alloy_primitives::TxHash;
use alloy_provider::PendingTransactionError;
use alloy_transport::TransportError;
use mupay::ExternalLedgerError;

/// Errors raised while talking to the escrow contract.
#[derive(Debug, thiserror::Error)]
pub enum EvmContractError {
    /// RPC transport error.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Pending transaction error, including receipt timeouts.
    #[error(transparent)]
    PendingTransaction(#[from] PendingTransactionError),
    /// On-chain transaction was reverted.
    #[error("Transaction {0} reverted")]
    TransactionReverted(TxHash),
    /// Contract call failed.
    #[error("Contract call failed: {0}")]
    ContractCall(String),
    /// An argument does not fit the contract's ABI types.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl EvmContractError {
    /// Wraps the error as a failure of the escrow entry point `operation`.
    #[must_use]
    pub fn into_ledger_error(self, operation: &'static str) -> ExternalLedgerError {
        let error = ExternalLedgerError::new(operation, self.to_string());
        match self {
            Self::TransactionReverted(tx_hash) => error.with_tx_hash(tx_hash),
            Self::Transport(_)
            | Self::PendingTransaction(_)
            | Self::ContractCall(_)
            | Self::InvalidArgument(_) => error,
        }
    }
}

impl From<alloy_contract::Error> for EvmContractError {
    fn from(e: alloy_contract::Error) -> Self {
        match e {
            alloy_contract::Error::UnknownFunction(_)
            | alloy_contract::Error::UnknownSelector(_)
            | alloy_contract::Error::NotADeploymentTransaction
            | alloy_contract::Error::ContractNotDeployed
            | alloy_contract::Error::ZeroData(_, _)
            | alloy_contract::Error::AbiError(_) => Self::ContractCall(e.to_string()),
            alloy_contract::Error::TransportError(e) => Self::Transport(e),
            alloy_contract::Error::PendingTransactionError(e) => Self::PendingTransaction(e),
        }
    }
}
