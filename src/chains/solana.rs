//! Solana chain client
//!
//! Plays the Solana side of every role: claim ledger and settlement chain for
//! Solana-originated requests, payout chain and evidence source for
//! EVM-originated ones, message sink for `release_spl`, and the on-chain
//! surface of the confidential-compute network.
//!
//! Solana has no fee replacement: a "replacement" is a fresh submission with
//! a new blockhash. Config validation holds the receipt window above blockhash
//! validity, so a replaced transaction has expired before its replacement is
//! sent; the executor still polls replaced signatures.

use async_trait::async_trait;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcTransactionConfig;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use solana_sdk::system_instruction;
use solana_sdk::transaction::Transaction;
use solana_transaction_status::option_serializer::OptionSerializer;
use solana_transaction_status::{UiLoadedAddresses, UiTransactionEncoding, UiTransactionTokenBalance};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::claims::ClaimLedger;
use crate::contracts::solana_program::{
    associated_token_address, computation_status, create_associated_token_account_idempotent,
    resealed_payload, transfer_checked, BridgeProgram, BridgeRequestAccount, ComputationStatus,
    ReleaseSplArgs, VerifyAndSettleArgs,
};
use crate::error::BridgeError;
use crate::evidence::{BalanceSnapshot, DeliveryEvidence, EvidenceSource, TokenBalanceEntry};
use crate::executor::PayoutChain;
use crate::hash::bytes32_to_hex;
use crate::message::CanonicalMessage;
use crate::resolver::ComputationNetwork;
use crate::retry::rpc_error;
use crate::settlement::{Attestation, MessageSink, SettlementChain, SourceState};
use crate::token_mapping::PayoutAsset;
use crate::types::{BridgeRequest, Claim, Direction, RequestId, ResolvedDestination, TxStatus};

/// SPL token account layout: mint(32) || owner(32) || amount(u64 LE) || ...
const TOKEN_ACCOUNT_AMOUNT_OFFSET: usize = 64;

fn token_account_amount(data: &[u8]) -> Option<u64> {
    let raw = data.get(TOKEN_ACCOUNT_AMOUNT_OFFSET..TOKEN_ACCOUNT_AMOUNT_OFFSET + 8)?;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(raw);
    Some(u64::from_le_bytes(bytes))
}

fn parse_pubkey(value: &str) -> Result<Pubkey, BridgeError> {
    Pubkey::from_str(value)
        .map_err(|e| BridgeError::Validation(format!("invalid Solana pubkey {}: {}", value, e)))
}

fn parse_signature(value: &str) -> Result<Signature, BridgeError> {
    Signature::from_str(value)
        .map_err(|e| BridgeError::Validation(format!("invalid signature {}: {}", value, e)))
}

fn to_lamports(amount: u128, what: &str) -> Result<u64, BridgeError> {
    u64::try_from(amount).map_err(|_| BridgeError::Validation(format!("{} {} exceeds u64", what, amount)))
}

fn token_entries(balances: OptionSerializer<Vec<UiTransactionTokenBalance>>) -> Vec<TokenBalanceEntry> {
    Option::<Vec<UiTransactionTokenBalance>>::from(balances)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|b| {
            let owner = Option::<String>::from(b.owner)?;
            Some(TokenBalanceEntry {
                account_index: b.account_index as usize,
                owner: Pubkey::from_str(&owner).ok()?.to_bytes(),
                mint: Pubkey::from_str(&b.mint).ok()?.to_bytes(),
                amount: b.ui_token_amount.amount.parse().ok()?,
            })
        })
        .collect()
}

/// Request as seen by the relay, built from the on-chain account
pub fn request_from_account(account: &BridgeRequestAccount) -> BridgeRequest {
    BridgeRequest {
        request_id: RequestId::from_u64(account.request_id),
        direction: Direction::SolToEvm,
        sender: Pubkey::new_from_array(account.owner).to_string(),
        source_token: Pubkey::new_from_array(account.token_mint).to_string(),
        amount: u128::from(account.amount),
        destination_handle: account.destination_handle,
        created_at: account.created_at,
        finalized: account.finalized,
        fee: u128::from(account.fee),
    }
}

pub struct SolanaClient {
    rpc: Arc<RpcClient>,
    keypair: Keypair,
    program: BridgeProgram,
}

impl SolanaClient {
    pub fn new(rpc_url: &str, keypair: Keypair, program: BridgeProgram) -> Self {
        let rpc = RpcClient::new_with_commitment(rpc_url.to_string(), CommitmentConfig::confirmed());
        info!(
            relay_pubkey = %keypair.pubkey(),
            program_id = %program.program_id,
            mpc_program_id = %program.mpc_program_id,
            "Solana client initialized"
        );
        Self {
            rpc: Arc::new(rpc),
            keypair,
            program,
        }
    }

    pub fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    pub fn program(&self) -> &BridgeProgram {
        &self.program
    }

    async fn account_data(&self, address: &Pubkey) -> Result<Option<Vec<u8>>, BridgeError> {
        let response = self
            .rpc
            .get_account_with_commitment(address, CommitmentConfig::confirmed())
            .await
            .map_err(|e| rpc_error("get_account", e))?;
        Ok(response.value.map(|account| account.data))
    }

    /// Decoded request account; `None` if it does not exist
    pub async fn fetch_request(
        &self,
        owner: &Pubkey,
        request_id: u64,
    ) -> Result<Option<BridgeRequestAccount>, BridgeError> {
        match self.account_data(&self.program.request_pda(owner, request_id)).await? {
            Some(data) => BridgeRequestAccount::decode(&data).map(Some),
            None => Ok(None),
        }
    }

    async fn request_account(&self, request: &BridgeRequest) -> Result<Option<BridgeRequestAccount>, BridgeError> {
        let owner = Pubkey::new_from_array(request.resolution_owner()?);
        self.fetch_request(&owner, request.request_id.low_u64()).await
    }

    async fn signed(&self, instructions: &[Instruction]) -> Result<Transaction, BridgeError> {
        let blockhash = self
            .rpc
            .get_latest_blockhash()
            .await
            .map_err(|e| rpc_error("get_latest_blockhash", e))?;
        Ok(Transaction::new_signed_with_payer(
            instructions,
            Some(&self.keypair.pubkey()),
            &[&self.keypair],
            blockhash,
        ))
    }

    async fn send(&self, instructions: &[Instruction], context: &str) -> Result<String, BridgeError> {
        let tx = self.signed(instructions).await?;
        let signature = self
            .rpc
            .send_transaction(&tx)
            .await
            .map_err(|e| rpc_error(context, e))?;
        debug!(signature = %signature, context, "Solana transaction sent");
        Ok(signature.to_string())
    }

    async fn signature_status(&self, tx: &str) -> Result<TxStatus, BridgeError> {
        let signature = parse_signature(tx)?;
        let response = self
            .rpc
            .get_signature_statuses(&[signature])
            .await
            .map_err(|e| rpc_error("get_signature_statuses", e))?;
        match response.value.into_iter().next().flatten() {
            None => Ok(TxStatus::Pending),
            Some(status) => {
                if let Some(err) = status.err {
                    Ok(TxStatus::Failed(err.to_string()))
                } else if status.satisfies_commitment(CommitmentConfig::confirmed()) {
                    Ok(TxStatus::Confirmed)
                } else {
                    Ok(TxStatus::Pending)
                }
            }
        }
    }

    fn mint_of(asset: &PayoutAsset) -> Result<Option<(Pubkey, u8)>, BridgeError> {
        match asset {
            PayoutAsset::Native => Ok(None),
            PayoutAsset::Token { address, decimals } => Ok(Some((parse_pubkey(address)?, *decimals))),
        }
    }
}

#[async_trait]
impl ComputationNetwork for SolanaClient {
    async fn submit_reseal(
        &self,
        request_id: u64,
        owner: &[u8; 32],
        offset: u64,
        reseal_pubkey: &[u8; 32],
        bond: u64,
    ) -> Result<String, BridgeError> {
        let ix = self.program.claim_request(
            &self.keypair.pubkey(),
            &Pubkey::new_from_array(*owner),
            request_id,
            offset,
            *reseal_pubkey,
            bond,
        )?;
        self.send(&[ix], "claim_request").await
    }

    async fn computation_status(&self, offset: u64) -> Result<Option<ComputationStatus>, BridgeError> {
        match self.account_data(&self.program.computation_pda(offset)).await? {
            Some(data) => computation_status(&data).map(Some),
            None => Ok(None),
        }
    }

    async fn fetch_resealed(&self, request_id: u64, owner: &[u8; 32]) -> Result<Vec<u8>, BridgeError> {
        let address = self
            .program
            .reseal_pda(&Pubkey::new_from_array(*owner), request_id);
        let data = self.account_data(&address).await?.ok_or_else(|| {
            BridgeError::DecryptionFailed(format!("resealed output {} missing", address))
        })?;
        Ok(resealed_payload(&data)?.to_vec())
    }
}

#[async_trait]
impl ClaimLedger for SolanaClient {
    fn chain(&self) -> &'static str {
        "solana"
    }

    fn solver_identity(&self) -> [u8; 32] {
        self.keypair.pubkey().to_bytes()
    }

    async fn current_claim(&self, request: &BridgeRequest) -> Result<Option<Claim>, BridgeError> {
        Ok(self.request_account(request).await?.and_then(|a| a.claim()))
    }

    async fn submit_claim(
        &self,
        request: &BridgeRequest,
        bond: u128,
        replaces: Option<&str>,
    ) -> Result<String, BridgeError> {
        let owner = Pubkey::new_from_array(request.resolution_owner()?);
        let ix = self.program.claim_bridge(
            &self.keypair.pubkey(),
            &owner,
            request.request_id.low_u64(),
            to_lamports(bond, "bond")?,
        )?;
        let signature = self.send(&[ix], "claim_bridge").await?;
        info!(
            request_id = %request.request_id,
            tx_hash = %signature,
            bond = %bond,
            replaces = replaces.unwrap_or(""),
            "claim_bridge sent"
        );
        Ok(signature)
    }

    async fn claim_status(&self, tx: &str) -> Result<TxStatus, BridgeError> {
        self.signature_status(tx).await
    }
}

#[async_trait]
impl SettlementChain for SolanaClient {
    fn chain(&self) -> &'static str {
        "solana"
    }

    fn solver_identity(&self) -> [u8; 32] {
        self.keypair.pubkey().to_bytes()
    }

    async fn source_state(&self, request: &BridgeRequest) -> Result<Option<SourceState>, BridgeError> {
        Ok(self.request_account(request).await?.map(|account| SourceState {
            finalized: account.finalized,
            claim: account.claim(),
        }))
    }

    async fn send_settlement(
        &self,
        request: &BridgeRequest,
        dest_tx: &str,
        evidence_hash: &[u8; 32],
        evidence_url: &str,
    ) -> Result<String, BridgeError> {
        let account = self
            .request_account(request)
            .await?
            .ok_or_else(|| BridgeError::RequestNotFound(request.request_id.to_string()))?;
        let owner = Pubkey::new_from_array(account.owner);
        let args = VerifyAndSettleArgs {
            request_id: account.request_id,
            dest_tx_hash: dest_tx.to_string(),
            evidence_hash: *evidence_hash,
            evidence_url: evidence_url.to_string(),
        };
        let solver = self.keypair.pubkey();
        let (ix, context) = if account.is_native() {
            (self.program.verify_and_settle(&solver, &owner, args)?, "verify_and_settle")
        } else {
            let mint = Pubkey::new_from_array(account.token_mint);
            (
                self.program.verify_and_settle_spl(&solver, &owner, &mint, args)?,
                "verify_and_settle_spl",
            )
        };
        let signature = self.send(&[ix], context).await?;
        info!(request_id = %request.request_id, tx_hash = %signature, context, "Settlement sent");
        Ok(signature)
    }

    async fn settlement_status(&self, tx: &str) -> Result<TxStatus, BridgeError> {
        self.signature_status(tx).await
    }
}

#[async_trait]
impl PayoutChain for SolanaClient {
    fn chain(&self) -> &'static str {
        "solana"
    }

    async fn balance(&self, asset: &PayoutAsset) -> Result<u128, BridgeError> {
        let me = self.keypair.pubkey();
        match Self::mint_of(asset)? {
            None => self
                .rpc
                .get_balance(&me)
                .await
                .map(u128::from)
                .map_err(|e| rpc_error("get_balance", e)),
            Some((mint, _)) => {
                let data = self.account_data(&associated_token_address(&me, &mint)).await?;
                Ok(data
                    .as_deref()
                    .and_then(token_account_amount)
                    .map(u128::from)
                    .unwrap_or(0))
            }
        }
    }

    async fn submit_transfer(
        &self,
        to: &ResolvedDestination,
        asset: &PayoutAsset,
        amount: u128,
        replaces: Option<&str>,
    ) -> Result<String, BridgeError> {
        let me = self.keypair.pubkey();
        let recipient = to.solana_pubkey();
        let lamports = to_lamports(amount, "amount")?;
        let instructions = match Self::mint_of(asset)? {
            None => vec![system_instruction::transfer(&me, &recipient, lamports)],
            Some((mint, decimals)) => vec![
                create_associated_token_account_idempotent(&me, &recipient, &mint),
                transfer_checked(
                    &associated_token_address(&me, &mint),
                    &mint,
                    &associated_token_address(&recipient, &mint),
                    &me,
                    lamports,
                    decimals,
                ),
            ],
        };
        let signature = self.send(&instructions, "payout").await?;
        info!(
            tx_hash = %signature,
            recipient = %recipient,
            amount = %amount,
            token = asset.token_address().unwrap_or("native"),
            replaces = replaces.unwrap_or(""),
            "Solana payout sent"
        );
        Ok(signature)
    }

    async fn transfer_status(&self, tx: &str) -> Result<TxStatus, BridgeError> {
        self.signature_status(tx).await
    }
}

#[async_trait]
impl EvidenceSource for SolanaClient {
    fn chain(&self) -> &'static str {
        "solana"
    }

    async fn fetch_evidence(&self, tx: &str) -> Result<DeliveryEvidence, BridgeError> {
        let signature = parse_signature(tx)?;
        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Base64),
            commitment: Some(CommitmentConfig::confirmed()),
            max_supported_transaction_version: Some(0),
        };
        let confirmed = self
            .rpc
            .get_transaction_with_config(&signature, config)
            .await
            .map_err(|e| {
                let message = e.to_string();
                if message.contains("null") || message.contains("not found") {
                    BridgeError::NotYetVisible(tx.to_string())
                } else {
                    rpc_error("get_transaction", message)
                }
            })?;

        let meta = confirmed
            .transaction
            .meta
            .ok_or_else(|| BridgeError::NotYetVisible(format!("{} has no metadata", tx)))?;
        if meta.err.is_some() {
            return Ok(DeliveryEvidence::Balances(BalanceSnapshot::default()));
        }
        let decoded = confirmed
            .transaction
            .transaction
            .decode()
            .ok_or_else(|| BridgeError::Validation(format!("cannot decode transaction {}", tx)))?;

        let mut account_keys: Vec<[u8; 32]> = decoded
            .message
            .static_account_keys()
            .iter()
            .map(|k| k.to_bytes())
            .collect();
        if let Some(loaded) = Option::<UiLoadedAddresses>::from(meta.loaded_addresses) {
            for key in loaded.writable.iter().chain(loaded.readonly.iter()) {
                account_keys.push(parse_pubkey(key)?.to_bytes());
            }
        }

        Ok(DeliveryEvidence::Balances(BalanceSnapshot {
            account_keys,
            pre_balances: meta.pre_balances,
            post_balances: meta.post_balances,
            pre_token_balances: token_entries(meta.pre_token_balances),
            post_token_balances: token_entries(meta.post_token_balances),
        }))
    }
}

#[async_trait]
impl MessageSink for SolanaClient {
    fn chain(&self) -> &'static str {
        "solana"
    }

    async fn deliver(
        &self,
        message: &CanonicalMessage,
        msg_id: &[u8; 32],
        asset: &PayoutAsset,
        amount: u128,
        attestation: &Attestation,
    ) -> Result<String, BridgeError> {
        let Some((mint, _)) = Self::mint_of(asset)? else {
            return Err(BridgeError::Validation(
                "release_spl requires a mapped token mint".to_string(),
            ));
        };
        let recipient = Pubkey::new_from_array(message.recipient);
        let ix = self.program.release_spl(
            &self.keypair.pubkey(),
            &recipient,
            &mint,
            ReleaseSplArgs {
                msg_id: *msg_id,
                amount: to_lamports(amount, "amount")?,
                v: attestation.v,
                r: attestation.r,
                s: attestation.s,
            },
        )?;
        let signature = self.send(&[ix], "release_spl").await?;
        info!(msg_id = %bytes32_to_hex(msg_id), tx_hash = %signature, recipient = %recipient, "release_spl sent");
        Ok(signature)
    }

    async fn delivery_status(&self, tx: &str) -> Result<TxStatus, BridgeError> {
        self.signature_status(tx).await
    }
}
