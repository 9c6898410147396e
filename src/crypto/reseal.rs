//! Resealed-output decoding for confidential destination resolution
//!
//! The compute network re-encrypts the destination under a caller-supplied
//! X25519 key. The output account holds `nonce (16) || 4 x word (32)`; each
//! word decrypts to one 64-bit limb of the 256-bit destination value.

use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::BridgeError;

pub const RESEAL_NONCE_LEN: usize = 16;
pub const WORD_LEN: usize = 32;
pub const LIMB_COUNT: usize = 4;
pub const RESEALED_LEN: usize = RESEAL_NONCE_LEN + WORD_LEN * LIMB_COUNT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResealedOutput {
    pub nonce: [u8; RESEAL_NONCE_LEN],
    pub words: [[u8; WORD_LEN]; LIMB_COUNT],
}

impl ResealedOutput {
    /// Parse the account payload (after the account discriminator).
    ///
    /// Anything shorter than the fixed layout is a fatal decode error;
    /// trailing allocation padding is ignored.
    pub fn parse(data: &[u8]) -> Result<Self, BridgeError> {
        if data.len() < RESEALED_LEN {
            return Err(BridgeError::DecryptionFailed(format!(
                "resealed output is {} bytes, expected {}",
                data.len(),
                RESEALED_LEN
            )));
        }
        let mut nonce = [0u8; RESEAL_NONCE_LEN];
        nonce.copy_from_slice(&data[..RESEAL_NONCE_LEN]);
        let mut words = [[0u8; WORD_LEN]; LIMB_COUNT];
        for (i, word) in words.iter_mut().enumerate() {
            let start = RESEAL_NONCE_LEN + i * WORD_LEN;
            word.copy_from_slice(&data[start..start + WORD_LEN]);
        }
        Ok(Self { nonce, words })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RESEALED_LEN);
        out.extend_from_slice(&self.nonce);
        for word in &self.words {
            out.extend_from_slice(word);
        }
        out
    }
}

/// Symmetric limb cipher exposed by the compute network
pub trait LimbCipher: Send + Sync {
    fn decrypt_limb(
        &self,
        shared: &[u8; 32],
        nonce: &[u8; RESEAL_NONCE_LEN],
        index: usize,
        word: &[u8; WORD_LEN],
    ) -> Result<u64, BridgeError>;

    fn encrypt_limb(
        &self,
        shared: &[u8; 32],
        nonce: &[u8; RESEAL_NONCE_LEN],
        index: usize,
        limb: u64,
    ) -> [u8; WORD_LEN];
}

/// Keystream cipher: `word = (limb_le || 0^24) XOR SHA-256(shared || nonce || index)`.
///
/// A non-zero tail after decryption means the wrong key or a corrupt word.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeystreamLimbCipher;

impl KeystreamLimbCipher {
    fn keystream(shared: &[u8; 32], nonce: &[u8; RESEAL_NONCE_LEN], index: usize) -> [u8; 32] {
        Sha256::new()
            .chain_update(shared)
            .chain_update(nonce)
            .chain_update((index as u64).to_le_bytes())
            .finalize()
            .into()
    }
}

impl LimbCipher for KeystreamLimbCipher {
    fn decrypt_limb(
        &self,
        shared: &[u8; 32],
        nonce: &[u8; RESEAL_NONCE_LEN],
        index: usize,
        word: &[u8; WORD_LEN],
    ) -> Result<u64, BridgeError> {
        let stream = Self::keystream(shared, nonce, index);
        let mut plain = [0u8; WORD_LEN];
        for (i, byte) in plain.iter_mut().enumerate() {
            *byte = word[i] ^ stream[i];
        }
        if plain[8..].iter().any(|b| *b != 0) {
            return Err(BridgeError::DecryptionFailed(format!(
                "limb {} did not decrypt to a 64-bit value",
                index
            )));
        }
        let mut limb = [0u8; 8];
        limb.copy_from_slice(&plain[..8]);
        Ok(u64::from_le_bytes(limb))
    }

    fn encrypt_limb(
        &self,
        shared: &[u8; 32],
        nonce: &[u8; RESEAL_NONCE_LEN],
        index: usize,
        limb: u64,
    ) -> [u8; WORD_LEN] {
        let stream = Self::keystream(shared, nonce, index);
        let mut word = [0u8; WORD_LEN];
        word[..8].copy_from_slice(&limb.to_le_bytes());
        for (i, byte) in word.iter_mut().enumerate() {
            *byte ^= stream[i];
        }
        word
    }
}

/// Ephemeral X25519 key handed to the network for one resolution
pub struct ResealKey {
    secret: StaticSecret,
    public: PublicKey,
}

impl ResealKey {
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_bytes(secret: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(secret))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// ECDH against the network key; low-order peer keys are rejected
    pub fn shared_secret(&self, network_public: &[u8; 32]) -> Result<[u8; 32], BridgeError> {
        let shared = self
            .secret
            .diffie_hellman(&PublicKey::from(*network_public));
        if !shared.was_contributory() {
            return Err(BridgeError::DecryptionFailed(
                "non-contributory key exchange".to_string(),
            ));
        }
        Ok(*shared.as_bytes())
    }
}

pub fn decrypt_limbs(
    cipher: &dyn LimbCipher,
    shared: &[u8; 32],
    output: &ResealedOutput,
) -> Result<[u64; LIMB_COUNT], BridgeError> {
    let mut limbs = [0u64; LIMB_COUNT];
    for (i, word) in output.words.iter().enumerate() {
        limbs[i] = cipher.decrypt_limb(shared, &output.nonce, i, word)?;
    }
    Ok(limbs)
}

/// Pack limbs big-endian: limb 0 is the most significant 64 bits
pub fn pack_limbs(limbs: [u64; LIMB_COUNT]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, limb) in limbs.iter().enumerate() {
        out[i * 8..(i + 1) * 8].copy_from_slice(&limb.to_be_bytes());
    }
    out
}

pub fn split_limbs(value: &[u8; 32]) -> [u64; LIMB_COUNT] {
    let mut limbs = [0u64; LIMB_COUNT];
    for (i, limb) in limbs.iter_mut().enumerate() {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&value[i * 8..(i + 1) * 8]);
        *limb = u64::from_be_bytes(raw);
    }
    limbs
}

/// Network-side sealing of a value, used by local test networks
pub fn seal_value(
    cipher: &dyn LimbCipher,
    shared: &[u8; 32],
    nonce: [u8; RESEAL_NONCE_LEN],
    value: &[u8; 32],
) -> ResealedOutput {
    let limbs = split_limbs(value);
    let mut words = [[0u8; WORD_LEN]; LIMB_COUNT];
    for (i, word) in words.iter_mut().enumerate() {
        *word = cipher.encrypt_limb(shared, &nonce, i, limbs[i]);
    }
    ResealedOutput { nonce, words }
}
