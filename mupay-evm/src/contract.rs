//! Solidity interface definitions for on-chain interactions.
//!
//! - [`IMuPay`] - The hash-chain escrow contract
//! - [`IERC20`] - Allowance subset of ERC-20, used before funding a channel

use alloy_sol_types::sol;

sol! {
    /// Hash-chain channel escrow.
    ///
    /// Channels are keyed by `(payer, merchant, token)`; `token == address(0)`
    /// escrows the native asset sent as call value. `redeemChannel` re-hashes
    /// `finalHashValue` `numberOfTokensUsed` times and compares the result
    /// with the stored trust anchor before paying out.
    #[allow(missing_docs)]
    #[allow(clippy::too_many_arguments)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IMuPay {
        event ChannelCreated(
            address indexed payer,
            address indexed merchant,
            address indexed token,
            uint256 amount,
            uint256 numberOfTokens,
            uint256 merchantWithdrawAfterBlocks
        );

        function createChannel(
            address merchant,
            address token,
            bytes32 trustAnchor,
            uint256 amount,
            uint16 numberOfTokens,
            uint64 merchantWithdrawAfterBlocks,
            uint64 payerWithdrawAfterBlocks
        ) external payable;

        function redeemChannel(
            address payer,
            address token,
            bytes32 finalHashValue,
            uint256 numberOfTokensUsed
        ) external;

        function reclaimChannel(address merchant, address token) external;

        function channelsMapping(address payer, address merchant, address token)
            external
            view
            returns (
                bytes32 trustAnchor,
                uint256 amount,
                uint16 numberOfTokens,
                uint64 merchantWithdrawAfterBlocks,
                uint64 payerWithdrawAfterBlocks
            );
    }
}

sol! {
    /// Minimal ERC-20 interface for allowance checks and approvals.
    #[allow(missing_docs)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IERC20 {
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
    }
}
