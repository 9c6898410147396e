//! Hashing and 32-byte word helpers shared by both chain legs
//!
//! Every identity the relay handles (EVM addresses, Solana public keys,
//! request ids, token addresses) is normalised to a 32-byte word. EVM
//! addresses are left-padded, matching `abi.encode` of an `address`.

use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;
use tiny_keccak::{Hasher, Keccak};

use crate::error::BridgeError;

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Hash recorded on the source chain in place of the raw delivery evidence.
///
/// keccak256(keccak256(destTxId) || recipient || amount), amount as a
/// big-endian uint256 word.
pub fn evidence_hash(dest_tx_id: &str, recipient: &[u8; 32], amount: u128) -> [u8; 32] {
    let mut data = [0u8; 96];
    data[0..32].copy_from_slice(&keccak256(dest_tx_id.as_bytes()));
    data[32..64].copy_from_slice(recipient);
    data[64 + 16..96].copy_from_slice(&amount.to_be_bytes());
    keccak256(&data)
}

/// Write a u64 as a big-endian uint256 word
pub fn u64_word(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..32].copy_from_slice(&value.to_be_bytes());
    word
}

/// Write a u128 as a big-endian uint256 word
pub fn u128_word(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..32].copy_from_slice(&value.to_be_bytes());
    word
}

/// Encode an EVM address (0x-prefixed hex) to 32 bytes (left-padded)
pub fn encode_evm_address(addr: &str) -> Result<[u8; 32], BridgeError> {
    let hex_str = addr.strip_prefix("0x").unwrap_or(addr);
    if hex_str.len() != 40 {
        return Err(BridgeError::Validation(format!(
            "invalid EVM address length: {}",
            addr
        )));
    }
    let raw = hex::decode(hex_str)
        .map_err(|_| BridgeError::Validation(format!("invalid EVM address: {}", addr)))?;
    let mut result = [0u8; 32];
    result[12..].copy_from_slice(&raw);
    Ok(result)
}

/// Parse a 0x-prefixed 32-byte hex word
pub fn parse_bytes32(value: &str) -> Result<[u8; 32], BridgeError> {
    let hex_str = value.strip_prefix("0x").unwrap_or(value);
    if hex_str.len() != 64 {
        return Err(BridgeError::Validation(format!(
            "expected 32-byte hex value, got {} chars",
            hex_str.len()
        )));
    }
    let raw = hex::decode(hex_str)
        .map_err(|_| BridgeError::Validation(format!("invalid hex: {}", value)))?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&raw);
    Ok(out)
}

/// Normalise any configured identity to a 32-byte word.
///
/// Accepts a 20-byte EVM address, a 32-byte hex word or a base58 Solana key.
pub fn identity_to_bytes32(value: &str) -> Result<[u8; 32], BridgeError> {
    let trimmed = value.trim();
    if let Some(hex_str) = trimmed.strip_prefix("0x") {
        return match hex_str.len() {
            40 => encode_evm_address(trimmed),
            64 => parse_bytes32(trimmed),
            _ => Err(BridgeError::Validation(format!(
                "invalid identity: {}",
                trimmed
            ))),
        };
    }
    Pubkey::from_str(trimmed)
        .map(|pk| pk.to_bytes())
        .map_err(|_| BridgeError::Validation(format!("invalid identity: {}", trimmed)))
}

/// Convert bytes to hex string with 0x prefix
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Render the low 20 bytes of a word as a checksum-free EVM address
pub fn bytes32_to_evm_address(word: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(&word[12..]))
}

/// Serde adapter for `[u8; 32]` as a 0x-prefixed hex string
pub mod serde_hex32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::bytes32_to_hex(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_bytes32(&raw).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for u128 amounts as decimal strings (JSON numbers lose precision)
pub mod serde_u128_str {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
