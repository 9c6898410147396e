//! Canonical cross-chain message for the attested-messaging variant
//!
//! `msgId = keccak256(version || dir || srcChainId || dstChainId || srcTxId ||
//! originToken || amount || recipient || nonce || expiry)` with every field
//! encoded as a big-endian 32-byte word.

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::hash::{bytes32_to_hex, keccak256, u128_word, u64_word};
use crate::types::Direction;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalMessage {
    pub version: u8,
    pub dir: Direction,
    pub src_chain_id: u64,
    pub dst_chain_id: u64,
    #[serde(with = "crate::hash::serde_hex32")]
    pub src_tx_id: [u8; 32],
    #[serde(with = "crate::hash::serde_hex32")]
    pub origin_token: [u8; 32],
    #[serde(with = "crate::hash::serde_u128_str")]
    pub amount: u128,
    #[serde(with = "crate::hash::serde_hex32")]
    pub recipient: [u8; 32],
    pub nonce: u64,
    pub expiry: u64,
}

impl CanonicalMessage {
    pub fn msg_id(&self) -> [u8; 32] {
        let mut data = [0u8; 320];
        data[31] = self.version;
        data[63] = self.dir.code();
        data[64..96].copy_from_slice(&u64_word(self.src_chain_id));
        data[96..128].copy_from_slice(&u64_word(self.dst_chain_id));
        data[128..160].copy_from_slice(&self.src_tx_id);
        data[160..192].copy_from_slice(&self.origin_token);
        data[192..224].copy_from_slice(&u128_word(self.amount));
        data[224..256].copy_from_slice(&self.recipient);
        data[256..288].copy_from_slice(&u64_word(self.nonce));
        data[288..320].copy_from_slice(&u64_word(self.expiry));
        keccak256(&data)
    }

    /// Reject a message whose carried id does not match its contents
    pub fn verify_id(&self, carried: &[u8; 32]) -> Result<(), BridgeError> {
        let computed = self.msg_id();
        if &computed != carried {
            return Err(BridgeError::Tamper {
                carried: bytes32_to_hex(carried),
                computed: bytes32_to_hex(&computed),
            });
        }
        Ok(())
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expiry != 0 && now >= self.expiry
    }
}

/// Decrypted envelope payload: the message plus the id the emitter computed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedEnvelopeBody {
    #[serde(with = "crate::hash::serde_hex32")]
    pub msg_id: [u8; 32],
    pub message: CanonicalMessage,
}
