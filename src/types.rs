//! Core domain types shared by watchers, pipelines and the store

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BridgeError;
use crate::hash::{bytes32_to_hex, parse_bytes32};

/// Unique id of a bridge request (EVM `bytes32`; Solana `u64` widened to a word)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub [u8; 32]);

impl RequestId {
    /// Solana request ids are u64 counters, stored big-endian in the low word bytes
    pub fn from_u64(id: u64) -> Self {
        Self(crate::hash::u64_word(id))
    }

    /// Low 64 bits, used to address the Solana-side request account
    pub fn low_u64(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.0[24..32]);
        u64::from_be_bytes(raw)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bytes32_to_hex(&self.0))
    }
}

impl FromStr for RequestId {
    type Err = BridgeError;

    /// Accepts a 0x-prefixed 32-byte word or a decimal Solana request id
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("0x") {
            return parse_bytes32(s).map(RequestId);
        }
        s.parse::<u64>()
            .map(RequestId::from_u64)
            .map_err(|_| BridgeError::Validation(format!("invalid request id: {}", s)))
    }
}

impl Serialize for RequestId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Transfer direction (source chain -> destination chain)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "evm-to-sol")]
    EvmToSol,
    #[serde(rename = "sol-to-evm")]
    SolToEvm,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::EvmToSol => "evm-to-sol",
            Direction::SolToEvm => "sol-to-evm",
        }
    }

    /// Numeric tag used in canonical messages
    pub fn code(&self) -> u8 {
        match self {
            Direction::EvmToSol => 0,
            Direction::SolToEvm => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Direction::EvmToSol),
            1 => Some(Direction::SolToEvm),
            _ => None,
        }
    }

    pub fn source_chain(&self) -> &'static str {
        match self {
            Direction::EvmToSol => "evm",
            Direction::SolToEvm => "solana",
        }
    }

    pub fn destination_chain(&self) -> &'static str {
        match self {
            Direction::EvmToSol => "solana",
            Direction::SolToEvm => "evm",
        }
    }

    /// Database table holding records for this direction
    pub fn table(&self) -> &'static str {
        match self {
            Direction::EvmToSol => "evm_to_sol_requests",
            Direction::SolToEvm => "sol_to_evm_requests",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "evm-to-sol" => Ok(Direction::EvmToSol),
            "sol-to-evm" => Ok(Direction::SolToEvm),
            other => Err(BridgeError::Validation(format!(
                "unknown direction: {}",
                other
            ))),
        }
    }
}

/// A user-initiated lock observed on the source chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeRequest {
    pub request_id: RequestId,
    pub direction: Direction,
    /// 0x address on EVM, base58 key on Solana
    pub sender: String,
    /// Source token; the native coin is the zero address / default pubkey
    pub source_token: String,
    #[serde(with = "crate::hash::serde_u128_str")]
    pub amount: u128,
    /// Opaque reference to the encrypted destination, never the plaintext
    #[serde(with = "crate::hash::serde_hex32")]
    pub destination_handle: [u8; 32],
    pub created_at: i64,
    pub finalized: bool,
    #[serde(with = "crate::hash::serde_u128_str")]
    pub fee: u128,
}

impl BridgeRequest {
    /// Owner of the Solana request account holding the encrypted destination.
    ///
    /// Solana-originated requests are owned by their sender. EVM-originated
    /// requests reference the owner through the destination handle.
    pub fn resolution_owner(&self) -> Result<[u8; 32], BridgeError> {
        match self.direction {
            Direction::SolToEvm => crate::hash::identity_to_bytes32(&self.sender),
            Direction::EvmToSol => Ok(self.destination_handle),
        }
    }
}

/// A bonded, time-boxed claim on a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    #[serde(with = "crate::hash::serde_hex32")]
    pub solver: [u8; 32],
    #[serde(with = "crate::hash::serde_u128_str")]
    pub bond: u128,
    pub claimed_at: u64,
    pub deadline: u64,
}

impl Claim {
    /// Active iff a solver is set and the deadline has not passed
    pub fn is_active(&self, now: u64) -> bool {
        self.solver != [0u8; 32] && now < self.deadline
    }
}

/// Plaintext destination produced by confidential resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedDestination(pub [u8; 32]);

impl ResolvedDestination {
    /// The network addresses EVM recipients by the low 160 bits
    pub fn evm_address(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        out.copy_from_slice(&self.0[12..32]);
        out
    }

    /// Solana recipients use the full 256-bit value as a public key
    pub fn solana_pubkey(&self) -> solana_sdk::pubkey::Pubkey {
        solana_sdk::pubkey::Pubkey::new_from_array(self.0)
    }

    /// Keep only the bits meaningful on the destination chain
    pub fn for_direction(raw: [u8; 32], direction: Direction) -> Self {
        match direction {
            Direction::SolToEvm => {
                let mut word = [0u8; 32];
                word[12..].copy_from_slice(&raw[12..]);
                Self(word)
            }
            Direction::EvmToSol => Self(raw),
        }
    }

    /// Destination-chain rendering used in records and logs
    pub fn render(&self, direction: Direction) -> String {
        match direction {
            Direction::SolToEvm => format!("0x{}", hex::encode(self.evm_address())),
            Direction::EvmToSol => self.solana_pubkey().to_string(),
        }
    }
}

/// Outcome of polling a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed(String),
}

/// Persisted lifecycle of a bridge request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Received,
    Verified,
    Settled,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Received => "RECEIVED",
            RequestStatus::Verified => "VERIFIED",
            RequestStatus::Settled => "SETTLED",
            RequestStatus::Failed => "FAILED",
        }
    }

    pub fn rank(&self) -> i16 {
        match self {
            RequestStatus::Received => 0,
            RequestStatus::Verified => 1,
            RequestStatus::Settled => 2,
            RequestStatus::Failed => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Settled | RequestStatus::Failed)
    }

    /// Forward-only: same or later status, or FAILED from any live state
    pub fn accepts(&self, next: RequestStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == RequestStatus::Failed || next.rank() >= self.rank()
    }
}

impl FromStr for RequestStatus {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RECEIVED" => Ok(RequestStatus::Received),
            "VERIFIED" => Ok(RequestStatus::Verified),
            "SETTLED" => Ok(RequestStatus::Settled),
            "FAILED" => Ok(RequestStatus::Failed),
            other => Err(BridgeError::Store(format!("unknown request status {}", other))),
        }
    }
}

/// Persisted lifecycle of an attested message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgStatus {
    Observed,
    Attested,
    Submitted,
    Confirmed,
    Failed,
}

impl MsgStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgStatus::Observed => "Observed",
            MsgStatus::Attested => "Attested",
            MsgStatus::Submitted => "Submitted",
            MsgStatus::Confirmed => "Confirmed",
            MsgStatus::Failed => "Failed",
        }
    }

    pub fn rank(&self) -> i16 {
        match self {
            MsgStatus::Observed => 0,
            MsgStatus::Attested => 1,
            MsgStatus::Submitted => 2,
            MsgStatus::Confirmed => 3,
            MsgStatus::Failed => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MsgStatus::Confirmed | MsgStatus::Failed)
    }

    pub fn accepts(&self, next: MsgStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == MsgStatus::Failed || next.rank() >= self.rank()
    }
}

impl FromStr for MsgStatus {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Observed" => Ok(MsgStatus::Observed),
            "Attested" => Ok(MsgStatus::Attested),
            "Submitted" => Ok(MsgStatus::Submitted),
            "Confirmed" => Ok(MsgStatus::Confirmed),
            "Failed" => Ok(MsgStatus::Failed),
            other => Err(BridgeError::Store(format!("unknown message status {}", other))),
        }
    }
}

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_parsing() {
        let id: RequestId = "42".parse().unwrap();
        assert_eq!(id.low_u64(), 42);
        let round: RequestId = id.to_string().parse().unwrap();
        assert_eq!(round, id);
        assert!("0x12".parse::<RequestId>().is_err());
        assert!("abc".parse::<RequestId>().is_err());
    }

    #[test]
    fn test_claim_activity_boundaries() {
        let claim = Claim {
            solver: [1u8; 32],
            bond: 10,
            claimed_at: 100,
            deadline: 200,
        };
        assert!(claim.is_active(199));
        assert!(!claim.is_active(200));

        let empty = Claim {
            solver: [0u8; 32],
            ..claim
        };
        assert!(!empty.is_active(150));
    }

    #[test]
    fn test_request_status_forward_only() {
        assert!(RequestStatus::Received.accepts(RequestStatus::Verified));
        assert!(RequestStatus::Received.accepts(RequestStatus::Received));
        assert!(RequestStatus::Verified.accepts(RequestStatus::Failed));
        assert!(!RequestStatus::Verified.accepts(RequestStatus::Received));
        assert!(!RequestStatus::Settled.accepts(RequestStatus::Failed));
        assert!(!RequestStatus::Failed.accepts(RequestStatus::Received));
    }

    #[test]
    fn test_msg_status_forward_only() {
        assert!(MsgStatus::Observed.accepts(MsgStatus::Attested));
        assert!(MsgStatus::Submitted.accepts(MsgStatus::Confirmed));
        assert!(MsgStatus::Attested.accepts(MsgStatus::Failed));
        assert!(!MsgStatus::Submitted.accepts(MsgStatus::Attested));
        assert!(!MsgStatus::Confirmed.accepts(MsgStatus::Failed));
    }

    #[test]
    fn test_destination_low_160_bits_for_evm() {
        let mut raw = [0xaau8; 32];
        raw[31] = 0x01;
        let dest = ResolvedDestination::for_direction(raw, Direction::SolToEvm);
        assert_eq!(&dest.0[..12], &[0u8; 12]);
        assert_eq!(dest.evm_address()[19], 0x01);
        assert_eq!(
            ResolvedDestination::for_direction(raw, Direction::EvmToSol).0,
            raw
        );
    }

    #[test]
    fn test_direction_round_trip() {
        for dir in [Direction::EvmToSol, Direction::SolToEvm] {
            assert_eq!(dir.as_str().parse::<Direction>().unwrap(), dir);
            assert_eq!(Direction::from_code(dir.code()), Some(dir));
        }
        assert!("sideways".parse::<Direction>().is_err());
    }
}
