//! Solana bridge program binding (IDL version 1)
//!
//! Anchor conventions: instruction data starts with
//! `sha256("global:<name>")[..8]`, events with `sha256("event:<Name>")[..8]`
//! and accounts with `sha256("account:<Name>")[..8]`. Arguments are borsh.

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::system_program;

use crate::error::BridgeError;
use crate::types::Claim;

pub const IDL_VERSION: u8 = 1;

pub const CONFIG_SEED: &[u8] = b"config";
pub const REQUEST_SEED: &[u8] = b"request";
pub const BOND_SEED: &[u8] = b"bond";
pub const SIGN_SEED: &[u8] = b"sign";
pub const RESEAL_SEED: &[u8] = b"reseal";
pub const VAULT_SEED: &[u8] = b"vault";
pub const COMPUTATION_SEED: &[u8] = b"computation";

pub const TOKEN_PROGRAM_ID: Pubkey =
    solana_sdk::pubkey!("TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA");
pub const ASSOCIATED_TOKEN_PROGRAM_ID: Pubkey =
    solana_sdk::pubkey!("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL");

/// Byte offset of the status flag in a computation account
pub const COMPUTATION_STATUS_OFFSET: usize = 8;

const DISCRIMINATOR_LEN: usize = 8;

pub fn discriminator(namespace: &str, name: &str) -> [u8; 8] {
    let digest = Sha256::digest(format!("{}:{}", namespace, name).as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

fn instruction_data<T: BorshSerialize>(name: &str, args: &T) -> Result<Vec<u8>, BridgeError> {
    let mut data = discriminator("global", name).to_vec();
    let encoded = args
        .try_to_vec()
        .map_err(|e| BridgeError::Validation(format!("encode {} args: {}", name, e)))?;
    data.extend_from_slice(&encoded);
    Ok(data)
}

/// Strip and check an 8-byte discriminator, then borsh-decode the rest
fn decode_tagged<T: BorshDeserialize>(
    data: &[u8],
    expected: [u8; 8],
    what: &str,
) -> Result<T, BridgeError> {
    if data.len() < DISCRIMINATOR_LEN || data[..DISCRIMINATOR_LEN] != expected {
        return Err(BridgeError::Validation(format!("not a {} payload", what)));
    }
    let mut rest = &data[DISCRIMINATOR_LEN..];
    T::deserialize(&mut rest).map_err(|e| BridgeError::Validation(format!("decode {}: {}", what, e)))
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ClaimBridgeArgs {
    pub request_id: u64,
    pub bond: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ClaimRequestArgs {
    pub computation_offset: u64,
    pub request_id: u64,
    pub reseal_pubkey: [u8; 32],
    pub bond: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VerifyAndSettleArgs {
    pub request_id: u64,
    pub dest_tx_hash: String,
    pub evidence_hash: [u8; 32],
    pub evidence_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ReleaseSplArgs {
    pub msg_id: [u8; 32],
    pub amount: u64,
    pub v: u8,
    pub r: [u8; 32],
    pub s: [u8; 32],
}

/// `BridgeInitiated` event emitted by `initiate_bridge`
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BridgeInitiatedEvent {
    pub request_id: u64,
    pub owner: [u8; 32],
    pub token_mint: [u8; 32],
    pub amount: u64,
    pub fee: u64,
    pub destination_handle: [u8; 32],
    pub created_at: i64,
}

impl BridgeInitiatedEvent {
    pub fn decode(data: &[u8]) -> Result<Self, BridgeError> {
        decode_tagged(data, discriminator("event", "BridgeInitiated"), "BridgeInitiated")
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = discriminator("event", "BridgeInitiated").to_vec();
        // borsh into a Vec cannot fail for fixed-size fields
        out.extend(self.try_to_vec().unwrap_or_default());
        out
    }
}

/// `BridgeRequest` account layout
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BridgeRequestAccount {
    pub owner: [u8; 32],
    pub request_id: u64,
    pub token_mint: [u8; 32],
    pub amount: u64,
    pub destination_handle: [u8; 32],
    pub created_at: i64,
    pub finalized: bool,
    pub fee: u64,
    pub solver: [u8; 32],
    pub bond: u64,
    pub claimed_at: i64,
    pub deadline: i64,
}

impl BridgeRequestAccount {
    pub fn decode(data: &[u8]) -> Result<Self, BridgeError> {
        decode_tagged(data, discriminator("account", "BridgeRequest"), "BridgeRequest")
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = discriminator("account", "BridgeRequest").to_vec();
        out.extend(self.try_to_vec().unwrap_or_default());
        out
    }

    pub fn claim(&self) -> Option<Claim> {
        if self.solver == [0u8; 32] {
            return None;
        }
        Some(Claim {
            solver: self.solver,
            bond: u128::from(self.bond),
            claimed_at: self.claimed_at.max(0) as u64,
            deadline: self.deadline.max(0) as u64,
        })
    }

    pub fn is_native(&self) -> bool {
        self.token_mint == [0u8; 32]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputationStatus {
    Queued,
    Finalized,
    Failed,
}

/// Read the status flag of an offset-addressed computation account
pub fn computation_status(data: &[u8]) -> Result<ComputationStatus, BridgeError> {
    match data.get(COMPUTATION_STATUS_OFFSET) {
        Some(0) => Ok(ComputationStatus::Queued),
        Some(1) => Ok(ComputationStatus::Finalized),
        Some(2) => Ok(ComputationStatus::Failed),
        Some(other) => Err(BridgeError::DecryptionFailed(format!(
            "unknown computation status {}",
            other
        ))),
        None => Err(BridgeError::DecryptionFailed(
            "computation account too short".to_string(),
        )),
    }
}

/// Strip the account discriminator from resealed-output account data
pub fn resealed_payload(data: &[u8]) -> Result<&[u8], BridgeError> {
    if data.len() < DISCRIMINATOR_LEN {
        return Err(BridgeError::DecryptionFailed(
            "resealed account too short".to_string(),
        ));
    }
    Ok(&data[DISCRIMINATOR_LEN..])
}

/// Associated token account address for (owner, mint)
pub fn associated_token_address(owner: &Pubkey, mint: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[owner.as_ref(), TOKEN_PROGRAM_ID.as_ref(), mint.as_ref()],
        &ASSOCIATED_TOKEN_PROGRAM_ID,
    )
    .0
}

/// `CreateIdempotent` on the associated token program
pub fn create_associated_token_account_idempotent(
    payer: &Pubkey,
    owner: &Pubkey,
    mint: &Pubkey,
) -> Instruction {
    Instruction {
        program_id: ASSOCIATED_TOKEN_PROGRAM_ID,
        accounts: vec![
            AccountMeta::new(*payer, true),
            AccountMeta::new(associated_token_address(owner, mint), false),
            AccountMeta::new_readonly(*owner, false),
            AccountMeta::new_readonly(*mint, false),
            AccountMeta::new_readonly(system_program::ID, false),
            AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),
        ],
        data: vec![1],
    }
}

/// SPL token `TransferChecked`
pub fn transfer_checked(
    source: &Pubkey,
    mint: &Pubkey,
    destination: &Pubkey,
    authority: &Pubkey,
    amount: u64,
    decimals: u8,
) -> Instruction {
    let mut data = Vec::with_capacity(10);
    data.push(12);
    data.extend_from_slice(&amount.to_le_bytes());
    data.push(decimals);
    Instruction {
        program_id: TOKEN_PROGRAM_ID,
        accounts: vec![
            AccountMeta::new(*source, false),
            AccountMeta::new_readonly(*mint, false),
            AccountMeta::new(*destination, false),
            AccountMeta::new_readonly(*authority, true),
        ],
        data,
    }
}

/// Addresses and instruction builders for one deployed bridge program
#[derive(Debug, Clone, Copy)]
pub struct BridgeProgram {
    pub program_id: Pubkey,
    pub mpc_program_id: Pubkey,
}

impl BridgeProgram {
    pub fn new(program_id: Pubkey, mpc_program_id: Pubkey) -> Self {
        Self {
            program_id,
            mpc_program_id,
        }
    }

    pub fn config_pda(&self) -> Pubkey {
        Pubkey::find_program_address(&[CONFIG_SEED], &self.program_id).0
    }

    pub fn request_pda(&self, owner: &Pubkey, request_id: u64) -> Pubkey {
        Pubkey::find_program_address(
            &[REQUEST_SEED, owner.as_ref(), &request_id.to_le_bytes()],
            &self.program_id,
        )
        .0
    }

    pub fn bond_pda(&self, request_id: u64) -> Pubkey {
        Pubkey::find_program_address(&[BOND_SEED, &request_id.to_le_bytes()], &self.program_id).0
    }

    pub fn sign_pda(&self) -> Pubkey {
        Pubkey::find_program_address(&[SIGN_SEED], &self.program_id).0
    }

    pub fn reseal_pda(&self, owner: &Pubkey, request_id: u64) -> Pubkey {
        Pubkey::find_program_address(
            &[RESEAL_SEED, owner.as_ref(), &request_id.to_le_bytes()],
            &self.program_id,
        )
        .0
    }

    pub fn vault_pda(&self) -> Pubkey {
        Pubkey::find_program_address(&[VAULT_SEED], &self.program_id).0
    }

    /// Offset-addressed computation account owned by the compute program
    pub fn computation_pda(&self, offset: u64) -> Pubkey {
        Pubkey::find_program_address(
            &[COMPUTATION_SEED, &offset.to_le_bytes()],
            &self.mpc_program_id,
        )
        .0
    }

    pub fn claim_bridge(
        &self,
        solver: &Pubkey,
        owner: &Pubkey,
        request_id: u64,
        bond: u64,
    ) -> Result<Instruction, BridgeError> {
        Ok(Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new(*solver, true),
                AccountMeta::new_readonly(self.config_pda(), false),
                AccountMeta::new(self.request_pda(owner, request_id), false),
                AccountMeta::new(self.bond_pda(request_id), false),
                AccountMeta::new_readonly(system_program::ID, false),
            ],
            data: instruction_data("claim_bridge", &ClaimBridgeArgs { request_id, bond })?,
        })
    }

    /// Claim plus reseal of the destination under `reseal_pubkey`
    pub fn claim_request(
        &self,
        solver: &Pubkey,
        owner: &Pubkey,
        request_id: u64,
        computation_offset: u64,
        reseal_pubkey: [u8; 32],
        bond: u64,
    ) -> Result<Instruction, BridgeError> {
        Ok(Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new(*solver, true),
                AccountMeta::new_readonly(self.config_pda(), false),
                AccountMeta::new(self.request_pda(owner, request_id), false),
                AccountMeta::new(self.bond_pda(request_id), false),
                AccountMeta::new(self.reseal_pda(owner, request_id), false),
                AccountMeta::new_readonly(self.sign_pda(), false),
                AccountMeta::new(self.computation_pda(computation_offset), false),
                AccountMeta::new_readonly(self.mpc_program_id, false),
                AccountMeta::new_readonly(system_program::ID, false),
            ],
            data: instruction_data(
                "claim_request",
                &ClaimRequestArgs {
                    computation_offset,
                    request_id,
                    reseal_pubkey,
                    bond,
                },
            )?,
        })
    }

    pub fn verify_and_settle(
        &self,
        solver: &Pubkey,
        owner: &Pubkey,
        args: VerifyAndSettleArgs,
    ) -> Result<Instruction, BridgeError> {
        let request_id = args.request_id;
        Ok(Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new(*solver, true),
                AccountMeta::new_readonly(self.config_pda(), false),
                AccountMeta::new(self.request_pda(owner, request_id), false),
                AccountMeta::new(self.bond_pda(request_id), false),
                AccountMeta::new(self.vault_pda(), false),
                AccountMeta::new_readonly(system_program::ID, false),
            ],
            data: instruction_data("verify_and_settle", &args)?,
        })
    }

    pub fn verify_and_settle_spl(
        &self,
        solver: &Pubkey,
        owner: &Pubkey,
        mint: &Pubkey,
        args: VerifyAndSettleArgs,
    ) -> Result<Instruction, BridgeError> {
        let request_id = args.request_id;
        let sign = self.sign_pda();
        Ok(Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new(*solver, true),
                AccountMeta::new_readonly(self.config_pda(), false),
                AccountMeta::new(self.request_pda(owner, request_id), false),
                AccountMeta::new(self.bond_pda(request_id), false),
                AccountMeta::new_readonly(sign, false),
                AccountMeta::new_readonly(*mint, false),
                AccountMeta::new(associated_token_address(&sign, mint), false),
                AccountMeta::new(associated_token_address(solver, mint), false),
                AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),
                AccountMeta::new_readonly(ASSOCIATED_TOKEN_PROGRAM_ID, false),
                AccountMeta::new_readonly(system_program::ID, false),
            ],
            data: instruction_data("verify_and_settle_spl", &args)?,
        })
    }

    /// Release vault tokens to the recipient of an attested message
    pub fn release_spl(
        &self,
        authority: &Pubkey,
        recipient: &Pubkey,
        mint: &Pubkey,
        args: ReleaseSplArgs,
    ) -> Result<Instruction, BridgeError> {
        let sign = self.sign_pda();
        Ok(Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new(*authority, true),
                AccountMeta::new_readonly(self.config_pda(), false),
                AccountMeta::new_readonly(sign, false),
                AccountMeta::new_readonly(*mint, false),
                AccountMeta::new(associated_token_address(&sign, mint), false),
                AccountMeta::new(associated_token_address(recipient, mint), false),
                AccountMeta::new_readonly(*recipient, false),
                AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),
                AccountMeta::new_readonly(ASSOCIATED_TOKEN_PROGRAM_ID, false),
                AccountMeta::new_readonly(system_program::ID, false),
            ],
            data: instruction_data("release_spl", &args)?,
        })
    }
}
