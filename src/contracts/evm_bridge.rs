//! EVM ConfidentialBridge contract ABI definition
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the bridge and
//! the ERC-20 surface used for payouts and delivery evidence.

#![allow(clippy::too_many_arguments)]

use alloy::sol;

sol! {
    /// ConfidentialBridge contract interface
    #[sol(rpc)]
    contract ConfidentialBridge {
        /// Raw request storage
        function bridgeRequests(bytes32 requestId) external view returns (
            address sender,
            address token,
            uint256 amount,
            bytes32 destinationHandle,
            uint64 createdAt,
            bool finalized,
            uint256 fee
        );

        /// Request view used by the watcher and settlement guards
        function getBridgeRequest(bytes32 requestId) external view returns (
            address sender,
            address token,
            uint256 amount,
            bytes32 destinationHandle,
            uint64 createdAt,
            bool finalized,
            uint256 fee
        );

        /// Current claim; solver is the zero address when unclaimed
        function requestClaim(bytes32 requestId) external view returns (
            address solver,
            uint256 bond,
            uint64 claimedAt,
            uint64 deadline
        );

        /// Claim a request by posting a bond (msg.value)
        function claimBridge(bytes32 requestId) external payable;

        /// Finalize a request with a hash of the destination evidence
        function verifyAndSettle(
            bytes32 requestId,
            string destTxHash,
            bytes32 evidenceHash,
            string evidenceURL
        ) external;

        /// Attested-message delivery
        function deliverTokens(address recipient, address token, uint256 amount) external;

        event BridgeInitiated(
            bytes32 indexed requestId,
            address indexed sender,
            address token,
            uint256 amountAfterFee
        );

        event BridgeClaimed(
            bytes32 indexed requestId,
            address indexed solver,
            uint256 bond,
            uint64 deadline
        );
    }
}

sol! {
    /// Minimal ERC-20 surface
    #[sol(rpc)]
    contract IERC20 {
        function transfer(address to, uint256 amount) external returns (bool);
        function balanceOf(address account) external view returns (uint256);

        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, FixedBytes, LogData, U256};
    use alloy::sol_types::{SolCall, SolEvent};

    #[test]
    fn test_bridge_initiated_decodes() {
        let event = ConfidentialBridge::BridgeInitiated {
            requestId: FixedBytes::from([1u8; 32]),
            sender: Address::repeat_byte(0x22),
            token: Address::repeat_byte(0x33),
            amountAfterFee: U256::from(1_000u64),
        };
        let data: LogData = event.encode_log_data();
        let decoded = ConfidentialBridge::BridgeInitiated::decode_log_data(&data, true).unwrap();
        assert_eq!(decoded.requestId, FixedBytes::from([1u8; 32]));
        assert_eq!(decoded.amountAfterFee, U256::from(1_000u64));
    }

    #[test]
    fn test_claim_selector_is_stable() {
        assert_eq!(
            ConfidentialBridge::claimBridgeCall::SIGNATURE,
            "claimBridge(bytes32)"
        );
        assert_eq!(
            ConfidentialBridge::verifyAndSettleCall::SIGNATURE,
            "verifyAndSettle(bytes32,string,bytes32,string)"
        );
    }
}
