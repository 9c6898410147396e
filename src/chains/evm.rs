//! EVM chain client
//!
//! One signer-backed client plays every EVM role in the relay: claim ledger
//! and settlement chain for EVM-originated requests, payout chain and
//! evidence source for Solana-originated ones, and message sink for
//! attested deliveries.
//!
//! Providers are built per call with `with_recommended_fillers()` so nonce,
//! gas and fees are filled automatically. Replacements reuse the replaced
//! transaction's nonce with bumped EIP-1559 fees.

use alloy::consensus::Transaction as _;
use alloy::network::EthereumWallet;
use alloy::primitives::{Address, FixedBytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolEvent;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{Result as EyreResult, WrapErr};
use std::str::FromStr;
use tracing::{debug, info};

use crate::claims::ClaimLedger;
use crate::contracts::evm_bridge::{ConfidentialBridge, IERC20};
use crate::error::BridgeError;
use crate::evidence::{DeliveryEvidence, EvidenceSource, ValueTransfer};
use crate::executor::PayoutChain;
use crate::hash::bytes32_to_hex;
use crate::message::CanonicalMessage;
use crate::retry::{rpc_error, RetryConfig};
use crate::settlement::{Attestation, MessageSink, SettlementChain, SourceState};
use crate::token_mapping::PayoutAsset;
use crate::types::{BridgeRequest, Claim, Direction, RequestId, ResolvedDestination, TxStatus};

/// Left-pad a 20-byte address into a 32-byte identity word
pub fn address_word(address: &Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_slice());
    word
}

fn u256_to_u128(value: U256, what: &str) -> Result<u128, BridgeError> {
    u128::try_from(value)
        .map_err(|_| BridgeError::Validation(format!("{} {} exceeds u128", what, value)))
}

fn parse_tx_hash(tx: &str) -> Result<B256, BridgeError> {
    B256::from_str(tx).map_err(|e| BridgeError::Validation(format!("invalid tx hash {}: {}", tx, e)))
}

fn parse_address(value: &str) -> Result<Address, BridgeError> {
    Address::from_str(value)
        .map_err(|e| BridgeError::Validation(format!("invalid EVM address {}: {}", value, e)))
}

pub struct EvmClient {
    rpc_url: String,
    chain_id: u64,
    bridge_address: Address,
    signer: PrivateKeySigner,
    retry: RetryConfig,
}

impl EvmClient {
    pub fn new(
        rpc_url: &str,
        chain_id: u64,
        bridge_address: &str,
        private_key: &str,
        retry: RetryConfig,
    ) -> EyreResult<Self> {
        let bridge_address =
            Address::from_str(bridge_address).wrap_err("Invalid bridge address")?;
        let signer: PrivateKeySigner = private_key.parse().wrap_err("Invalid private key")?;
        rpc_url
            .parse::<url::Url>()
            .wrap_err("Invalid EVM RPC URL")?;

        info!(
            relay_address = %signer.address(),
            bridge = %bridge_address,
            chain_id,
            "EVM client initialized"
        );

        Ok(Self {
            rpc_url: rpc_url.to_string(),
            chain_id,
            bridge_address,
            signer,
            retry,
        })
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn bridge_address(&self) -> Address {
        self.bridge_address
    }

    fn provider(&self) -> Result<impl Provider<Http<Client>> + Clone, BridgeError> {
        let url = self
            .rpc_url
            .parse()
            .map_err(|e| BridgeError::Validation(format!("invalid RPC URL: {}", e)))?;
        Ok(ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(EthereumWallet::from(self.signer.clone()))
            .on_http(url))
    }

    /// Source-chain request as seen by the bridge contract; `None` if unknown
    pub async fn fetch_request(&self, request_id: &RequestId) -> Result<Option<BridgeRequest>, BridgeError> {
        let provider = self.provider()?;
        let contract = ConfidentialBridge::new(self.bridge_address, &provider);
        let view = contract
            .getBridgeRequest(FixedBytes::from(request_id.0))
            .call()
            .await
            .map_err(|e| rpc_error("getBridgeRequest", e))?;

        if view.sender == Address::ZERO {
            return Ok(None);
        }
        Ok(Some(BridgeRequest {
            request_id: *request_id,
            direction: Direction::EvmToSol,
            sender: format!("{}", view.sender),
            source_token: format!("{}", view.token),
            amount: u256_to_u128(view.amount, "amount")?,
            destination_handle: view.destinationHandle.0,
            created_at: view.createdAt as i64,
            finalized: view.finalized,
            fee: u256_to_u128(view.fee, "fee")?,
        }))
    }

    /// Nonce and bumped fees for replacing a stuck transaction
    async fn replacement(&self, replaces: &str) -> Result<TransactionRequest, BridgeError> {
        let provider = self.provider()?;
        let original = provider
            .get_transaction_by_hash(parse_tx_hash(replaces)?)
            .await
            .map_err(|e| rpc_error("get_transaction_by_hash", e))?
            .ok_or_else(|| BridgeError::NotYetVisible(replaces.to_string()))?;
        let current = provider
            .estimate_eip1559_fees(None)
            .await
            .map_err(|e| rpc_error("estimate_eip1559_fees", e))?;

        let max_fee = self
            .retry
            .fee_for_attempt(original.max_fee_per_gas(), 1)
            .max(current.max_fee_per_gas);
        let priority = self
            .retry
            .fee_for_attempt(original.max_priority_fee_per_gas().unwrap_or(0), 1)
            .max(current.max_priority_fee_per_gas);
        debug!(
            replaces,
            nonce = original.nonce(),
            max_fee,
            priority,
            "Prepared replacement fees"
        );
        Ok(TransactionRequest::default()
            .nonce(original.nonce())
            .max_fee_per_gas(max_fee)
            .max_priority_fee_per_gas(priority))
    }

    async fn receipt_status(&self, tx: &str) -> Result<TxStatus, BridgeError> {
        let provider = self.provider()?;
        match provider
            .get_transaction_receipt(parse_tx_hash(tx)?)
            .await
            .map_err(|e| rpc_error("get_transaction_receipt", e))?
        {
            None => Ok(TxStatus::Pending),
            Some(receipt) if receipt.status() => Ok(TxStatus::Confirmed),
            Some(_) => Ok(TxStatus::Failed(format!("transaction {} reverted", tx))),
        }
    }
}

#[async_trait]
impl ClaimLedger for EvmClient {
    fn chain(&self) -> &'static str {
        "evm"
    }

    fn solver_identity(&self) -> [u8; 32] {
        address_word(&self.signer.address())
    }

    async fn current_claim(&self, request: &BridgeRequest) -> Result<Option<Claim>, BridgeError> {
        let provider = self.provider()?;
        let contract = ConfidentialBridge::new(self.bridge_address, &provider);
        let claim = contract
            .requestClaim(FixedBytes::from(request.request_id.0))
            .call()
            .await
            .map_err(|e| rpc_error("requestClaim", e))?;
        if claim.solver == Address::ZERO {
            return Ok(None);
        }
        Ok(Some(Claim {
            solver: address_word(&claim.solver),
            bond: u256_to_u128(claim.bond, "bond")?,
            claimed_at: claim.claimedAt,
            deadline: claim.deadline,
        }))
    }

    async fn submit_claim(
        &self,
        request: &BridgeRequest,
        bond: u128,
        replaces: Option<&str>,
    ) -> Result<String, BridgeError> {
        let provider = self.provider()?;
        let contract = ConfidentialBridge::new(self.bridge_address, &provider);
        let mut call = contract
            .claimBridge(FixedBytes::from(request.request_id.0))
            .value(U256::from(bond));
        if let Some(replaces) = replaces {
            let overrides = self.replacement(replaces).await?;
            if let (Some(nonce), Some(max_fee), Some(priority)) = (
                overrides.nonce,
                overrides.max_fee_per_gas,
                overrides.max_priority_fee_per_gas,
            ) {
                call = call
                    .nonce(nonce)
                    .max_fee_per_gas(max_fee)
                    .max_priority_fee_per_gas(priority);
            }
        }
        let pending = call.send().await.map_err(|e| rpc_error("claimBridge", e))?;
        let tx_hash = *pending.tx_hash();
        info!(request_id = %request.request_id, tx_hash = %tx_hash, bond = %bond, "claimBridge sent");
        Ok(format!("0x{:x}", tx_hash))
    }

    async fn claim_status(&self, tx: &str) -> Result<TxStatus, BridgeError> {
        self.receipt_status(tx).await
    }
}

#[async_trait]
impl SettlementChain for EvmClient {
    fn chain(&self) -> &'static str {
        "evm"
    }

    fn solver_identity(&self) -> [u8; 32] {
        address_word(&self.signer.address())
    }

    async fn source_state(&self, request: &BridgeRequest) -> Result<Option<SourceState>, BridgeError> {
        let Some(current) = self.fetch_request(&request.request_id).await? else {
            return Ok(None);
        };
        let claim = ClaimLedger::current_claim(self, request).await?;
        Ok(Some(SourceState {
            finalized: current.finalized,
            claim,
        }))
    }

    async fn send_settlement(
        &self,
        request: &BridgeRequest,
        dest_tx: &str,
        evidence_hash: &[u8; 32],
        evidence_url: &str,
    ) -> Result<String, BridgeError> {
        let provider = self.provider()?;
        let contract = ConfidentialBridge::new(self.bridge_address, &provider);
        let pending = contract
            .verifyAndSettle(
                FixedBytes::from(request.request_id.0),
                dest_tx.to_string(),
                FixedBytes::from(*evidence_hash),
                evidence_url.to_string(),
            )
            .send()
            .await
            .map_err(|e| rpc_error("verifyAndSettle", e))?;
        let tx_hash = *pending.tx_hash();
        info!(request_id = %request.request_id, tx_hash = %tx_hash, "verifyAndSettle sent");
        Ok(format!("0x{:x}", tx_hash))
    }

    async fn settlement_status(&self, tx: &str) -> Result<TxStatus, BridgeError> {
        self.receipt_status(tx).await
    }
}

#[async_trait]
impl PayoutChain for EvmClient {
    fn chain(&self) -> &'static str {
        "evm"
    }

    async fn balance(&self, asset: &PayoutAsset) -> Result<u128, BridgeError> {
        let provider = self.provider()?;
        let balance = match asset.token_address() {
            None => provider
                .get_balance(self.signer.address())
                .await
                .map_err(|e| rpc_error("get_balance", e))?,
            Some(token) => {
                IERC20::new(parse_address(token)?, &provider)
                    .balanceOf(self.signer.address())
                    .call()
                    .await
                    .map_err(|e| rpc_error("balanceOf", e))?
                    ._0
            }
        };
        // Balances past u128 are capped; every payout amount fits in u128
        Ok(u128::try_from(balance).unwrap_or(u128::MAX))
    }

    async fn submit_transfer(
        &self,
        to: &ResolvedDestination,
        asset: &PayoutAsset,
        amount: u128,
        replaces: Option<&str>,
    ) -> Result<String, BridgeError> {
        let provider = self.provider()?;
        let recipient = Address::from(to.evm_address());
        let overrides = match replaces {
            Some(replaces) => Some(self.replacement(replaces).await?),
            None => None,
        };

        let tx_hash = match asset.token_address() {
            None => {
                let mut tx = overrides.unwrap_or_default();
                tx = tx.to(recipient).value(U256::from(amount));
                let pending = provider
                    .send_transaction(tx)
                    .await
                    .map_err(|e| rpc_error("native transfer", e))?;
                *pending.tx_hash()
            }
            Some(token) => {
                let erc20 = IERC20::new(parse_address(token)?, &provider);
                let mut call = erc20.transfer(recipient, U256::from(amount));
                if let Some(o) = overrides {
                    if let (Some(nonce), Some(max_fee), Some(priority)) =
                        (o.nonce, o.max_fee_per_gas, o.max_priority_fee_per_gas)
                    {
                        call = call
                            .nonce(nonce)
                            .max_fee_per_gas(max_fee)
                            .max_priority_fee_per_gas(priority);
                    }
                }
                let pending = call.send().await.map_err(|e| rpc_error("ERC-20 transfer", e))?;
                *pending.tx_hash()
            }
        };
        info!(
            tx_hash = %tx_hash,
            recipient = %recipient,
            amount = %amount,
            token = asset.token_address().unwrap_or("native"),
            "EVM payout sent"
        );
        Ok(format!("0x{:x}", tx_hash))
    }

    async fn transfer_status(&self, tx: &str) -> Result<TxStatus, BridgeError> {
        self.receipt_status(tx).await
    }
}

#[async_trait]
impl EvidenceSource for EvmClient {
    fn chain(&self) -> &'static str {
        "evm"
    }

    async fn fetch_evidence(&self, tx: &str) -> Result<DeliveryEvidence, BridgeError> {
        let provider = self.provider()?;
        let hash = parse_tx_hash(tx)?;
        let receipt = provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| rpc_error("get_transaction_receipt", e))?
            .ok_or_else(|| BridgeError::NotYetVisible(tx.to_string()))?;
        if !receipt.status() {
            return Ok(DeliveryEvidence::Transfers(Vec::new()));
        }

        let mut transfers = Vec::new();
        for log in receipt.inner.logs() {
            if log.topics().first() != Some(&IERC20::Transfer::SIGNATURE_HASH) {
                continue;
            }
            let Ok(event) = IERC20::Transfer::decode_log_data(log.data(), true) else {
                continue;
            };
            transfers.push(ValueTransfer {
                from: address_word(&event.from),
                to: address_word(&event.to),
                asset: Some(address_word(&log.address())),
                amount: u128::try_from(event.value).unwrap_or(u128::MAX),
            });
        }

        let transaction = provider
            .get_transaction_by_hash(hash)
            .await
            .map_err(|e| rpc_error("get_transaction_by_hash", e))?
            .ok_or_else(|| BridgeError::NotYetVisible(tx.to_string()))?;
        if !transaction.value().is_zero() {
            if let Some(to) = transaction.to() {
                transfers.push(ValueTransfer {
                    from: address_word(&transaction.from),
                    to: address_word(&to),
                    asset: None,
                    amount: u256_to_u128(transaction.value(), "value")?,
                });
            }
        }
        Ok(DeliveryEvidence::Transfers(transfers))
    }
}

#[async_trait]
impl MessageSink for EvmClient {
    fn chain(&self) -> &'static str {
        "evm"
    }

    async fn deliver(
        &self,
        message: &CanonicalMessage,
        msg_id: &[u8; 32],
        asset: &PayoutAsset,
        amount: u128,
        attestation: &Attestation,
    ) -> Result<String, BridgeError> {
        let token = match asset.token_address() {
            Some(token) => parse_address(token)?,
            None => Address::ZERO,
        };
        let recipient = Address::from_slice(&message.recipient[12..]);
        let provider = self.provider()?;
        let contract = ConfidentialBridge::new(self.bridge_address, &provider);
        let pending = contract
            .deliverTokens(recipient, token, U256::from(amount))
            .send()
            .await
            .map_err(|e| rpc_error("deliverTokens", e))?;
        let tx_hash = *pending.tx_hash();
        info!(
            msg_id = %bytes32_to_hex(msg_id),
            tx_hash = %tx_hash,
            recipient = %recipient,
            attestation_v = attestation.v,
            "deliverTokens sent"
        );
        Ok(format!("0x{:x}", tx_hash))
    }

    async fn delivery_status(&self, tx: &str) -> Result<TxStatus, BridgeError> {
        self.receipt_status(tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn test_address_word_left_pads() {
        let address = Address::repeat_byte(0x11);
        let word = address_word(&address);
        assert_eq!(&word[..12], &[0u8; 12]);
        assert_eq!(&word[12..], address.as_slice());
    }

    #[test]
    fn test_solver_identity_is_signer_address() {
        let client = EvmClient::new(
            "http://localhost:8545",
            31337,
            "0x5FbDB2315678afecb367f032d93F642f64180aa3",
            TEST_KEY,
            RetryConfig::default(),
        )
        .unwrap();
        let identity = ClaimLedger::solver_identity(&client);
        assert_eq!(&identity[12..], client.address().as_slice());
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(EvmClient::new("http://localhost:8545", 1, "0x1234", TEST_KEY, RetryConfig::default()).is_err());
        assert!(EvmClient::new(
            "not a url",
            1,
            "0x5FbDB2315678afecb367f032d93F642f64180aa3",
            TEST_KEY,
            RetryConfig::default()
        )
        .is_err());
    }

    #[test]
    fn test_u256_conversion_bounds() {
        assert_eq!(u256_to_u128(U256::from(5u64), "x").unwrap(), 5);
        assert!(u256_to_u128(U256::MAX, "x").is_err());
    }
}
